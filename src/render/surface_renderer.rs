//! Surface renderer
//!
//! Owns one remote surface's pending framebuffer and drives it through
//! view creation, damage detection, and the graphics pipeline. One writer
//! (the capture side) submits framebuffers; the render tick on the
//! graphics runtime steals the pending slot, skips clean frames, and
//! encodes the damaged region.
//!
//! Any failure in the chain latches a persistent graphics-subsystem
//! failure: subsequent ticks become no-ops until the session tears down.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::buffer::PooledBuffer;
use crate::damage::DamageDetector;
use crate::egfx::{GfxError, GraphicsPipeline};
use crate::session::metrics::SessionMetrics;

use super::surface::Surface;
use super::view_creator::ViewCreator;

/// Errors produced while registering capture buffers
#[derive(Debug, Error)]
pub enum RendererError {
    /// Buffers of different backings were mixed within one stream
    #[error("Invalid buffer combination: mixed buffer types")]
    MixedBufferTypes,
}

/// Backing class of a registered capture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisteredBufferType {
    /// CPU memory
    Host,
    /// dma-buf with a DRM format modifier
    DmaBuf,
    /// mem-fd shared memory
    MemFd,
}

/// Sentinel for "no explicit DRM format modifier"
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

#[derive(Clone, Copy)]
struct RegisteredBufferInfo {
    buffer_type: RegisteredBufferType,
    drm_format_modifier: u64,
}

struct RendererState {
    surface: Surface,
    detector: Box<dyn DamageDetector>,
    view_creator: Box<dyn ViewCreator>,

    pending_framebuffer: Option<PooledBuffer>,
    rendering_suspended: bool,
    pending_render_context_reset: bool,
    graphics_subsystem_failed: bool,

    registered_buffers: HashSet<u64>,
    buffer_info: Option<RegisteredBufferInfo>,
}

struct RendererShared {
    state: Mutex<RendererState>,
    render_notify: Notify,
    pipeline: Arc<GraphicsPipeline>,
    metrics: Arc<SessionMetrics>,
    on_error: Box<dyn Fn(GfxError) + Send + Sync>,
}

/// Drives one [`Surface`] through damage detection and encoding
pub struct SurfaceRenderer {
    shared: Arc<RendererShared>,
    render_task: tokio::task::JoinHandle<()>,
}

impl SurfaceRenderer {
    /// Create a renderer and start its render tick
    pub fn new<E>(
        surface: Surface,
        detector: Box<dyn DamageDetector>,
        view_creator: Box<dyn ViewCreator>,
        pipeline: Arc<GraphicsPipeline>,
        metrics: Arc<SessionMetrics>,
        on_error: E,
    ) -> Self
    where
        E: Fn(GfxError) + Send + Sync + 'static,
    {
        let shared = Arc::new(RendererShared {
            state: Mutex::new(RendererState {
                surface,
                detector,
                view_creator,
                pending_framebuffer: None,
                rendering_suspended: false,
                pending_render_context_reset: false,
                graphics_subsystem_failed: false,
                registered_buffers: HashSet::new(),
                buffer_info: None,
            }),
            render_notify: Notify::new(),
            pipeline,
            metrics,
            on_error: Box::new(on_error),
        });

        let task_shared = Arc::clone(&shared);
        let render_task = tokio::spawn(async move {
            loop {
                task_shared.render_notify.notified().await;
                maybe_render_frame(&task_shared);
            }
        });

        Self { shared, render_task }
    }

    /// Refresh rate of the underlying surface
    pub fn refresh_rate(&self) -> u32 {
        self.shared.state.lock().surface.refresh_rate
    }

    /// Whether frame submission is currently paused
    pub fn is_rendering_suspended(&self) -> bool {
        self.shared.state.lock().rendering_suspended
    }

    /// Whether the failure latch has been set
    pub fn has_graphics_subsystem_failed(&self) -> bool {
        self.shared.state.lock().graphics_subsystem_failed
    }

    /// Suspend or resume rendering (frame-pacing decision)
    ///
    /// Resuming triggers a render tick so a parked pending frame is
    /// picked up immediately.
    pub fn update_suspension_state(&self, suspend_rendering: bool) {
        let was_suspended = {
            let mut state = self.shared.state.lock();
            let was = state.rendering_suspended;
            state.rendering_suspended = suspend_rendering;
            was
        };

        if was_suspended && !suspend_rendering {
            self.trigger_render_source();
        }
    }

    /// Register a capture buffer before its first submission
    ///
    /// All buffers of one stream must share one backing; a change in
    /// backing or in modifier presence (only possible once all buffers
    /// were unregistered) forces a render-context reset.
    pub fn register_buffer(
        &self,
        buffer_id: u64,
        buffer_type: RegisteredBufferType,
        drm_format_modifier: u64,
    ) -> Result<(), RendererError> {
        let mut state = self.shared.state.lock();

        if !state.registered_buffers.is_empty() {
            let info = state.buffer_info.expect("info exists while buffers are registered");
            if info.buffer_type != buffer_type {
                return Err(RendererError::MixedBufferTypes);
            }
            // only one DRM format modifier exists per stream; no per-buffer
            // check is needed beyond the type
        } else if let Some(info) = state.buffer_info {
            let type_changed = info.buffer_type != buffer_type;
            let modifier_presence_flipped = (info.drm_format_modifier == DRM_FORMAT_MOD_INVALID)
                != (drm_format_modifier == DRM_FORMAT_MOD_INVALID);
            if type_changed || modifier_presence_flipped {
                state.pending_render_context_reset = true;
            }
            state.buffer_info = None;
        }

        if state.buffer_info.is_none() {
            state.buffer_info = Some(RegisteredBufferInfo {
                buffer_type,
                drm_format_modifier,
            });
        }
        state.registered_buffers.insert(buffer_id);

        Ok(())
    }

    /// Unregister a capture buffer
    pub fn unregister_buffer(&self, buffer_id: u64) {
        self.shared.state.lock().registered_buffers.remove(&buffer_id);
    }

    /// Hand a captured framebuffer to the renderer
    ///
    /// Replaces (and releases) any still-pending frame.
    pub fn submit_buffer(&self, buffer: PooledBuffer) {
        {
            let mut state = self.shared.state.lock();
            state.pending_framebuffer = Some(buffer);
        }
        self.trigger_render_source();
    }

    /// Schedule a render tick
    pub fn trigger_render_source(&self) {
        self.shared.render_notify.notify_one();
    }

    /// Drop the pending frame (session reset)
    pub fn reset(&self) {
        self.shared.state.lock().pending_framebuffer = None;
    }

    /// Invalidate the surface: the next frame is sent in full
    pub fn invalidate_surface(&self) {
        let mut state = self.shared.state.lock();
        state.surface.valid = false;
        state.detector.invalidate_surface();
    }

    /// Run one render tick synchronously
    ///
    /// Test hook; production ticks run on the render task.
    pub fn run_render_tick(&self) {
        maybe_render_frame(&self.shared);
    }
}

impl Drop for SurfaceRenderer {
    fn drop(&mut self) {
        self.render_task.abort();
    }
}

fn handle_graphics_subsystem_failure(shared: &RendererShared, state: &mut RendererState, error: GfxError) {
    warn!("Graphics subsystem failed: {error}");
    state.graphics_subsystem_failed = true;
    (shared.on_error)(error);
}

fn maybe_render_frame(shared: &RendererShared) {
    let mut state = shared.state.lock();

    if state.graphics_subsystem_failed {
        return;
    }
    if state.pending_framebuffer.is_none() || state.rendering_suspended {
        return;
    }

    // pacing: the pipeline's controller may park the frame until an ack
    if let Some(controller) = state
        .surface
        .gfx_surface
        .as_ref()
        .and_then(|gfx_surface| gfx_surface.frame_controller().cloned())
    {
        if controller.is_rendering_suspended() {
            return;
        }
    }

    if state.pending_render_context_reset {
        debug!("Render context reset: invalidating surface");
        state.surface.valid = false;
        state.detector.invalidate_surface();
        state.pending_render_context_reset = false;
    }

    let mut buffer = state.pending_framebuffer.take().expect("checked above");

    if let Err(e) = state.view_creator.create_view(&mut buffer) {
        handle_graphics_subsystem_failure(shared, &mut state, GfxError::GraphicsSubsystemFailure(e.to_string()));
        return;
    }
    if let Err(e) = state.view_creator.finish_view(&mut buffer) {
        handle_graphics_subsystem_failure(shared, &mut state, GfxError::GraphicsSubsystemFailure(e.to_string()));
        return;
    }

    if let Err(e) = state.detector.submit_new_framebuffer(buffer) {
        handle_graphics_subsystem_failure(shared, &mut state, GfxError::GraphicsSubsystemFailure(e.to_string()));
        return;
    }

    if !state.detector.is_region_damaged() {
        return;
    }

    let damage_rects = match state.detector.get_damage_region() {
        Ok(rects) => rects,
        Err(e) => {
            handle_graphics_subsystem_failure(shared, &mut state, GfxError::GraphicsSubsystemFailure(e.to_string()));
            return;
        }
    };

    let state = &mut *state;
    let Some(frame) = state.detector.current_framebuffer() else {
        return;
    };

    match shared.pipeline.refresh_gfx(&mut state.surface, &damage_rects, frame) {
        Ok(()) => {
            shared.metrics.notify_frame_transmission();
        }
        Err(e) => {
            warn!("Failed to encode frame: {e}");
            state.graphics_subsystem_failed = true;
            (shared.on_error)(GfxError::GraphicsSubsystemFailure(e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::damage::MemcmpDetector;
    use crate::egfx::pipeline::GfxPduSink;
    use crate::egfx::PipelineEvent;
    use crate::render::view_creator::DirectViewCreator;
    use ironrdp_egfx::pdu::{CapabilitiesAdvertisePdu, CapabilitiesV104Flags, CapabilitySet, GfxPdu};
    use std::sync::mpsc;

    struct RecordingSink(mpsc::Sender<GfxPdu>);

    impl GfxPduSink for RecordingSink {
        fn send(&mut self, pdu: GfxPdu) -> crate::egfx::Result<()> {
            self.0.send(pdu).ok();
            Ok(())
        }
    }

    const W: u32 = 64;
    const H: u32 = 64;

    fn renderer_fixture() -> (SurfaceRenderer, BufferPool, mpsc::Receiver<GfxPdu>, mpsc::Receiver<GfxError>) {
        let (pdu_tx, pdu_rx) = mpsc::channel();
        let pipeline = Arc::new(crate::egfx::GraphicsPipeline::new(
            RecordingSink(pdu_tx),
            |_event: PipelineEvent| {},
            None,
        ));
        pipeline
            .handle_pdu(GfxPdu::CapabilitiesAdvertise(CapabilitiesAdvertisePdu(vec![
                CapabilitySet::V10_4 {
                    flags: CapabilitiesV104Flags::SMALL_CACHE,
                },
            ])))
            .unwrap();
        // drop negotiation traffic
        while pdu_rx.try_recv().is_ok() {}

        let mut detector = MemcmpDetector::new();
        detector.resize_surface(W, H).unwrap();

        let (error_tx, error_rx) = mpsc::channel();
        let renderer = SurfaceRenderer::new(
            Surface::new(W as u16, H as u16, 0, 0, 30),
            Box::new(detector),
            Box::new(DirectViewCreator),
            pipeline,
            Arc::new(SessionMetrics::new()),
            move |error| {
                error_tx.send(error).ok();
            },
        );

        let pool = BufferPool::new(2);
        pool.resize_buffers(W, H, W * 4).unwrap();

        (renderer, pool, pdu_rx, error_rx)
    }

    fn frame(pool: &BufferPool, fill: u8) -> PooledBuffer {
        let mut buffer = pool.acquire();
        buffer.local_data_mut().unwrap().fill(fill);
        buffer
    }

    #[tokio::test]
    async fn first_frame_is_encoded_in_full() {
        let (renderer, pool, pdu_rx, _error_rx) = renderer_fixture();

        renderer.submit_buffer(frame(&pool, 1));
        renderer.run_render_tick();

        let sent: Vec<GfxPdu> = pdu_rx.try_iter().collect();
        assert!(sent.iter().any(|pdu| matches!(pdu, GfxPdu::CreateSurface(_))));
        assert!(sent.iter().any(|pdu| matches!(pdu, GfxPdu::WireToSurface2(_))));
    }

    #[tokio::test]
    async fn unchanged_frame_is_skipped() {
        let (renderer, pool, pdu_rx, _error_rx) = renderer_fixture();

        renderer.submit_buffer(frame(&pool, 1));
        renderer.run_render_tick();
        while pdu_rx.try_recv().is_ok() {}

        renderer.submit_buffer(frame(&pool, 1));
        renderer.run_render_tick();
        assert!(pdu_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn suspension_parks_pending_frame() {
        let (renderer, pool, pdu_rx, _error_rx) = renderer_fixture();

        renderer.update_suspension_state(true);
        renderer.submit_buffer(frame(&pool, 1));
        renderer.run_render_tick();
        assert!(pdu_rx.try_recv().is_err());

        renderer.update_suspension_state(false);
        renderer.run_render_tick();
        let sent: Vec<GfxPdu> = pdu_rx.try_iter().collect();
        assert!(sent.iter().any(|pdu| matches!(pdu, GfxPdu::WireToSurface2(_))));
    }

    #[tokio::test]
    async fn mixed_buffer_types_are_rejected() {
        let (renderer, _pool, _pdu_rx, _error_rx) = renderer_fixture();

        renderer
            .register_buffer(0, RegisteredBufferType::MemFd, DRM_FORMAT_MOD_INVALID)
            .unwrap();
        let result = renderer.register_buffer(1, RegisteredBufferType::DmaBuf, 0);
        assert!(matches!(result, Err(RendererError::MixedBufferTypes)));
    }

    #[tokio::test]
    async fn modifier_presence_flip_forces_context_reset() {
        let (renderer, pool, pdu_rx, _error_rx) = renderer_fixture();

        renderer
            .register_buffer(0, RegisteredBufferType::DmaBuf, 0x1234)
            .unwrap();
        renderer.submit_buffer(frame(&pool, 1));
        renderer.run_render_tick();
        while pdu_rx.try_recv().is_ok() {}

        renderer.unregister_buffer(0);
        renderer
            .register_buffer(1, RegisteredBufferType::DmaBuf, DRM_FORMAT_MOD_INVALID)
            .unwrap();

        // context reset: the next frame is a full retransmit
        renderer.submit_buffer(frame(&pool, 1));
        renderer.run_render_tick();
        let sent: Vec<GfxPdu> = pdu_rx.try_iter().collect();
        assert!(sent.iter().any(|pdu| matches!(pdu, GfxPdu::CreateSurface(_))));
    }

    #[tokio::test]
    async fn failure_latch_stops_rendering() {
        let (renderer, pool, pdu_rx, error_rx) = renderer_fixture();

        // a dma-buf frame cannot be served by the direct view creator
        {
            let mut state = renderer.shared.state.lock();
            state.graphics_subsystem_failed = true;
        }
        renderer.submit_buffer(frame(&pool, 1));
        renderer.run_render_tick();
        assert!(pdu_rx.try_recv().is_err());
        assert!(error_rx.try_recv().is_err());
        assert!(renderer.has_graphics_subsystem_failed());
    }
}
