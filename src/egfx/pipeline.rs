//! Graphics pipeline protocol controller
//!
//! Server side of the MS-RDPEGFX channel: negotiates capabilities against
//! the peer's CapsAdvertise, manages wire surface and codec-context
//! lifetimes, allocates frame ids, tracks acknowledgements, and encodes
//! damaged regions with either the progressive wavelet codec or AVC420.
//!
//! # Frame tracking
//!
//! Every emitted frame records (frame id → surface serial) in the
//! unacknowledged-frames table and bumps the serial's reference count.
//! While the peer has suspended acknowledgements, emitted frames are
//! additionally self-acked and queued as tracked frame infos (bounded by
//! [`MAX_TRACKED_ENC_FRAMES`]); a later real acknowledgement rewrites that
//! history by re-unacking the queued tail on its surfaces, so the pacing
//! controllers see the true outstanding window again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ironrdp_egfx::pdu::{
    CacheImportReplyPdu, CapabilitiesConfirmPdu, CapabilitiesAdvertisePdu, CapabilitySet,
    CreateSurfacePdu, DeleteEncodingContextPdu, DeleteSurfacePdu, EndFramePdu,
    FrameAcknowledgePdu, GfxPdu, MapSurfaceToOutputPdu, PixelFormat, QueueDepth,
    ResetGraphicsPdu, StartFramePdu, SurfaceToSurfacePdu, Timestamp, WireToSurface2Pdu,
    Codec2Type, Point, QoeFrameAcknowledgePdu,
};
use ironrdp_pdu::gcc::Monitor;
use ironrdp_pdu::geometry::InclusiveRectangle;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::damage::DamageRegion;
use crate::render::Surface;
use crate::utils::monotonic_time_us;

use super::frame_controller::FrameController;
use super::gfx_surface::{GfxSurface, GfxSurfaceFlags};
use super::progressive::ProgressiveEncoder;
use super::rtt::{NetworkAutodetection, RttConsumer, RttNecessity};
use super::{GfxError, Result, ENC_TIMES_CHECK_INTERVAL, MAX_TRACKED_ENC_FRAMES, MIN_BW_MEASURE_SIZE, PROTOCOL_TIMEOUT};

/// Outgoing PDU sink
///
/// The DVC layer implements this; the pipeline never sees wire framing.
pub trait GfxPduSink: Send {
    /// Deliver one PDU to the peer
    fn send(&mut self, pdu: GfxPdu) -> Result<()>;
}

/// Session-level notifications emitted by the pipeline
#[derive(Debug)]
pub enum PipelineEvent {
    /// A CapsAdvertise was accepted; renderers must drop cached wire state
    Reset,
    /// Capability negotiation finished; frames may be submitted
    Ready,
    /// Unrecoverable protocol or subsystem error; tear the session down
    SessionError(GfxError),
}

type EventHandler = Box<dyn Fn(PipelineEvent) + Send + Sync>;

/// Server-supported capability versions, highest first
const SERVER_CAP_VERSIONS: [u32; 10] = [
    0xa_0701, // 10.7
    0xa_0600, // 10.6
    0xa_0502, // 10.5
    0xa_0400, // 10.4
    0xa_0301, // 10.3
    0xa_0200, // 10.2
    0xa_0100, // 10.1
    0xa_0002, // 10
    0x8_0105, // 8.1
    0x8_0004, // 8
];

const CAPVERSION_103: u32 = 0xa_0301;

fn caps_version_value(cap: &CapabilitySet) -> Option<u32> {
    Some(match cap {
        CapabilitySet::V8 { .. } => 0x8_0004,
        CapabilitySet::V8_1 { .. } => 0x8_0105,
        CapabilitySet::V10 { .. } => 0xa_0002,
        CapabilitySet::V10_1 => 0xa_0100,
        CapabilitySet::V10_2 { .. } => 0xa_0200,
        CapabilitySet::V10_3 { .. } => 0xa_0301,
        CapabilitySet::V10_4 { .. } => 0xa_0400,
        CapabilitySet::V10_5 { .. } => 0xa_0502,
        CapabilitySet::V10_6 { .. } => 0xa_0600,
        CapabilitySet::V10_6Err { .. } | CapabilitySet::Unknown(_) => return None,
        CapabilitySet::V10_7 { .. } => 0xa_0701,
    })
}

/// Codec enablement derived from the confirmed capability set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecCaps {
    /// AVC444v2 dual-stream encoding is allowed
    pub avc444v2: bool,
    /// Plain H.264 (AVC420) encoding is allowed
    pub h264: bool,
}

fn codec_caps_for(cap: &CapabilitySet) -> CodecCaps {
    use ironrdp_egfx::pdu::{CapabilitiesV103Flags, CapabilitiesV104Flags, CapabilitiesV10Flags, CapabilitiesV107Flags, CapabilitiesV81Flags};

    match cap {
        CapabilitySet::V10 { flags } | CapabilitySet::V10_2 { flags } => {
            let enabled = !flags.contains(CapabilitiesV10Flags::AVC_DISABLED);
            CodecCaps { avc444v2: enabled, h264: enabled }
        }
        CapabilitySet::V10_3 { flags } => {
            let enabled = !flags.contains(CapabilitiesV103Flags::AVC_DISABLED);
            CodecCaps { avc444v2: enabled, h264: enabled }
        }
        CapabilitySet::V10_4 { flags }
        | CapabilitySet::V10_5 { flags }
        | CapabilitySet::V10_6 { flags }
        | CapabilitySet::V10_6Err { flags } => {
            let enabled = !flags.contains(CapabilitiesV104Flags::AVC_DISABLED);
            CodecCaps { avc444v2: enabled, h264: enabled }
        }
        CapabilitySet::V10_7 { flags } => {
            let enabled = !flags.contains(CapabilitiesV107Flags::AVC_DISABLED);
            CodecCaps { avc444v2: enabled, h264: enabled }
        }
        CapabilitySet::V10_1 => CodecCaps { avc444v2: true, h264: true },
        CapabilitySet::V8_1 { flags } => CodecCaps {
            avc444v2: false,
            h264: flags.contains(CapabilitiesV81Flags::AVC420_ENABLED),
        },
        CapabilitySet::V8 { .. } | CapabilitySet::Unknown(_) => CodecCaps::default(),
    }
}

/// Select the highest server-supported capability present in the advertise
fn select_capability(cap_sets: &[CapabilitySet]) -> Option<CapabilitySet> {
    for version in SERVER_CAP_VERSIONS {
        if let Some(cap) = cap_sets
            .iter()
            .find(|cap| caps_version_value(cap) == Some(version))
        {
            return Some(cap.clone());
        }
    }
    None
}

#[cfg(feature = "nvenc")]
struct HwAccelContext {
    encode_session_id: u32,
    has_first_frame: bool,
}

struct GfxSurfaceContext {
    frame_controller: Option<Arc<FrameController>>,
    /// Cleared when the wire surface is deleted; the serial entry lives on
    /// until the last tracked frame referencing it drops
    surface_alive: bool,
    ref_count: u64,
}

struct GfxFrameInfo {
    frame_id: u32,
    enc_time_us: i64,
    surface_serial: u32,
}

struct SurfaceTableEntry {
    serial: u32,
    codec_context_id: u32,
    frame_controller: Option<Arc<FrameController>>,
}

#[derive(Default)]
struct GfxState {
    surface_table: HashMap<u16, SurfaceTableEntry>,
    codec_context_table: HashSet<u32>,

    /// Unacknowledged Frames ADM element ([MS-RDPEGFX] 3.2.1.2)
    frame_serial_table: HashMap<u32, u32>,
    serial_surface_table: HashMap<u32, GfxSurfaceContext>,
    frame_acks_suspended: bool,

    encoded_frames: VecDeque<GfxFrameInfo>,
    total_frames_encoded: u32,

    enc_times: VecDeque<i64>,
    rtt_pause_active: bool,

    #[cfg(feature = "nvenc")]
    surface_hwaccel_table: HashMap<u16, HwAccelContext>,

    next_frame_id: u32,
    next_surface_id: u16,
    next_serial: u32,
}

#[derive(Default)]
struct CapsState {
    received_first_cap_sets: bool,
    initialized: bool,
    initial_version: u32,
}

struct PipelineShared {
    sink: Mutex<Option<Box<dyn GfxPduSink>>>,
    gfx: Mutex<GfxState>,
    caps: Mutex<CapsState>,
    codec_caps: Mutex<CodecCaps>,
    encoder: Mutex<ProgressiveEncoder>,
    events: EventHandler,
    network_autodetection: Option<Arc<dyn NetworkAutodetection>>,
    /// Bumped on every pipeline reset; stale wire surfaces are detected by
    /// comparing against the epoch recorded at their creation
    epoch: AtomicU64,
    protocol_timeout: Mutex<Option<tokio::task::JoinHandle<()>>>,
    #[cfg(feature = "nvenc")]
    hwaccel: Option<Arc<crate::hwaccel::nvidia::NvidiaAccel>>,
}

impl PipelineShared {
    fn send(&self, pdu: GfxPdu) -> Result<()> {
        let mut sink = self.sink.lock();
        match sink.as_mut() {
            Some(sink) => sink.send(pdu),
            None => Err(GfxError::ChannelClosed),
        }
    }

    fn notify(&self, event: PipelineEvent) {
        (self.events)(event);
    }
}

/// MS-RDPEGFX server controller
pub struct GraphicsPipeline {
    shared: Arc<PipelineShared>,
}

impl GraphicsPipeline {
    /// Create a pipeline delivering PDUs to `sink` and notifications to
    /// `events`
    pub fn new<S, E>(sink: S, events: E, network_autodetection: Option<Arc<dyn NetworkAutodetection>>) -> Self
    where
        S: GfxPduSink + 'static,
        E: Fn(PipelineEvent) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(PipelineShared {
                sink: Mutex::new(Some(Box::new(sink))),
                gfx: Mutex::new(GfxState::default()),
                caps: Mutex::new(CapsState::default()),
                codec_caps: Mutex::new(CodecCaps::default()),
                encoder: Mutex::new(ProgressiveEncoder::new()),
                events: Box::new(events),
                network_autodetection,
                epoch: AtomicU64::new(0),
                protocol_timeout: Mutex::new(None),
                #[cfg(feature = "nvenc")]
                hwaccel: None,
            }),
        }
    }

    /// Attach the NVENC adapter (before the first surface is created)
    #[cfg(feature = "nvenc")]
    pub fn set_hwaccel(&mut self, hwaccel: Arc<crate::hwaccel::nvidia::NvidiaAccel>) {
        Arc::get_mut(&mut self.shared)
            .expect("hwaccel is attached before the pipeline is shared")
            .hwaccel = Some(hwaccel);
    }

    /// The channel is open; arm the CapsAdvertise timeout
    pub fn notify_channel_opened(&self) {
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            tokio::time::sleep(PROTOCOL_TIMEOUT).await;
            warn!("Client did not respond to protocol initiation. Terminating session");
            shared.notify(PipelineEvent::SessionError(GfxError::CapabilityMismatch(
                "No CapsAdvertise within the protocol timeout".into(),
            )));
        });

        if let Some(previous) = self.shared.protocol_timeout.lock().replace(task) {
            previous.abort();
        }
    }

    /// Codec enablement negotiated with the peer
    pub fn codec_caps(&self) -> CodecCaps {
        *self.shared.codec_caps.lock()
    }

    /// Current pipeline epoch; changes on every reset
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::Acquire)
    }

    /// Whether the peer has suspended frame acknowledgements
    pub fn is_frame_ack_suspended(&self) -> bool {
        self.shared.gfx.lock().frame_acks_suspended
    }

    /// Number of self-acked frames currently tracked
    pub fn tracked_frame_count(&self) -> usize {
        self.shared.gfx.lock().encoded_frames.len()
    }

    // =========================================================================
    // Incoming PDUs
    // =========================================================================

    /// Dispatch one decoded PDU from the peer
    pub fn handle_pdu(&self, pdu: GfxPdu) -> Result<()> {
        match pdu {
            GfxPdu::CapabilitiesAdvertise(advertise) => self.handle_caps_advertise(advertise),
            GfxPdu::FrameAcknowledge(ack) => {
                self.handle_frame_acknowledge(&ack);
                Ok(())
            }
            GfxPdu::QoeFrameAcknowledge(qoe) => {
                self.handle_qoe_frame_acknowledge(&qoe);
                Ok(())
            }
            GfxPdu::CacheImportOffer(_) => {
                // no cache entries are ever kept across sessions
                self.shared
                    .send(GfxPdu::CacheImportReply(CacheImportReplyPdu { cache_slots: vec![] }))
            }
            other => {
                trace!("Ignoring unexpected client PDU: {other:?}");
                Ok(())
            }
        }
    }

    fn handle_caps_advertise(&self, advertise: CapabilitiesAdvertisePdu) -> Result<()> {
        debug!("Received a CapsAdvertise PDU with {} capability set(s)", advertise.0.len());

        {
            let caps = self.shared.caps.lock();
            if caps.initialized && caps.initial_version < CAPVERSION_103 {
                let message = "Illegal CapsAdvertise: already initialized with initial version < 10.3";
                warn!("Protocol violation: {message}");
                self.shared.notify(PipelineEvent::SessionError(
                    GfxError::ProtocolViolation(message.into()),
                ));
                return Err(GfxError::ProtocolViolation(message.into()));
            }
        }

        let Some(selected) = select_capability(&advertise.0) else {
            let message = "CapsAdvertise does not contain any supported capability set";
            warn!("{message}");
            self.shared.notify(PipelineEvent::SessionError(
                GfxError::CapabilityMismatch(message.into()),
            ));
            return Err(GfxError::CapabilityMismatch(message.into()));
        };

        {
            let caps = self.shared.caps.lock();
            if caps.received_first_cap_sets && codec_caps_for(&selected) == CodecCaps::default() {
                let message = "CapsAdvertise would reset the protocol with AVC disabled";
                warn!("{message}");
                self.shared.notify(PipelineEvent::SessionError(
                    GfxError::CapabilityMismatch(message.into()),
                ));
                return Err(GfxError::CapabilityMismatch(message.into()));
            }
        }

        self.shared.caps.lock().received_first_cap_sets = true;

        if let Some(timeout) = self.shared.protocol_timeout.lock().take() {
            timeout.abort();
        }

        // renderers drop cached wire state before the confirm goes out
        self.shared.notify(PipelineEvent::Reset);
        self.accept_capability(selected)?;
        self.shared.notify(PipelineEvent::Ready);

        Ok(())
    }

    fn accept_capability(&self, selected: CapabilitySet) -> Result<()> {
        let codec_caps = codec_caps_for(&selected);
        let version = caps_version_value(&selected).expect("selected set is a supported version");

        info!(
            "CapsAdvertise: accepting capability version {:#x}; H264 (AVC444): {}, H264 (AVC420): {}",
            version, codec_caps.avc444v2, codec_caps.h264
        );

        {
            let mut caps = self.shared.caps.lock();
            if !caps.initialized {
                caps.initial_version = version;
            }
            caps.initialized = true;
        }
        *self.shared.codec_caps.lock() = codec_caps;

        self.reset_pipeline_state();

        self.shared
            .send(GfxPdu::CapabilitiesConfirm(CapabilitiesConfirmPdu(selected)))
    }

    fn handle_qoe_frame_acknowledge(&self, qoe: &QoeFrameAcknowledgePdu) {
        trace!(
            "QoE frame acknowledge: frame {}, timestamp {}",
            qoe.frame_id,
            qoe.timestamp
        );
    }

    // =========================================================================
    // Surface lifecycle
    // =========================================================================

    fn get_next_free_surface_id(&self, state: &GfxState) -> u16 {
        let mut surface_id = state.next_surface_id;
        while state.surface_table.contains_key(&surface_id) {
            surface_id = surface_id.wrapping_add(1);
        }
        surface_id
    }

    fn get_next_free_serial(&self, state: &GfxState) -> u32 {
        let mut serial = state.next_serial;
        while state.serial_surface_table.contains_key(&serial) {
            serial = serial.wrapping_add(1);
        }
        serial
    }

    /// Create a wire surface for `surface`
    ///
    /// When the H.264 codec applies and the hardware adapter creates an
    /// NVENC session, the surface is marked as needing no local data; if
    /// NVENC alignment exceeds the visible size, an auxiliary render
    /// surface of aligned size is created and attached.
    fn create_gfx_surface(
        &self,
        surface: &mut Surface,
        width: u16,
        height: u16,
        flags: GfxSurfaceFlags,
    ) -> Result<GfxSurface> {
        let (surface_id, serial) = {
            let mut state = self.shared.gfx.lock();
            let surface_id = self.get_next_free_surface_id(&state);
            state.next_surface_id = surface_id.wrapping_add(1);
            let serial = self.get_next_free_serial(&state);
            state.next_serial = serial.wrapping_add(1);

            state.surface_table.insert(
                surface_id,
                SurfaceTableEntry {
                    serial,
                    codec_context_id: u32::from(surface_id),
                    frame_controller: None,
                },
            );
            state.serial_surface_table.insert(
                serial,
                GfxSurfaceContext {
                    frame_controller: None,
                    surface_alive: true,
                    ref_count: 0,
                },
            );
            (surface_id, serial)
        };

        debug!("Creating surface with id {surface_id}");

        #[cfg_attr(not(feature = "nvenc"), allow(unused_mut))]
        let mut gfx_surface = GfxSurface::new(surface_id, serial, width, height, flags);

        #[cfg(feature = "nvenc")]
        let mut nvenc_aligned: Option<(u16, u16)> = None;

        #[cfg(feature = "nvenc")]
        if !gfx_surface.disallows_hwaccel_sessions() {
            let codec_caps = *self.shared.codec_caps.lock();
            if (codec_caps.h264 || codec_caps.avc444v2) && self.shared.hwaccel.is_some() {
                let hwaccel = self.shared.hwaccel.as_ref().expect("checked above");
                match hwaccel.create_nvenc_session(
                    u32::from(width),
                    u32::from(height),
                    surface.refresh_rate,
                ) {
                    Ok((encode_session_id, aligned_width, aligned_height)) => {
                        debug!("Created NVENC session for surface {surface_id}");

                        let mut state = self.shared.gfx.lock();
                        state.surface_hwaccel_table.insert(
                            surface_id,
                            HwAccelContext {
                                encode_session_id,
                                has_first_frame: false,
                            },
                        );
                        surface.needs_no_local_data = true;

                        let aligned_width_16 = crate::hwaccel::aligned_size(u32::from(width), 16) as u16;
                        let aligned_height_16 = crate::hwaccel::aligned_size(u32::from(height), 16) as u16;
                        if aligned_width as u16 != aligned_width_16
                            || aligned_height as u16 != aligned_height_16
                        {
                            nvenc_aligned = Some((aligned_width as u16, aligned_height as u16));
                        }
                    }
                    Err(e) => {
                        debug!("No NVENC session for surface {surface_id}: {e}");
                    }
                }
            }
        }

        self.shared.send(GfxPdu::CreateSurface(CreateSurfacePdu {
            surface_id,
            width,
            height,
            pixel_format: PixelFormat::XRgb,
        }))?;

        #[cfg(feature = "nvenc")]
        if let Some((aligned_width, aligned_height)) = nvenc_aligned {
            debug!(
                "Creating separate render surface for surface {surface_id} ({aligned_width}x{aligned_height})"
            );
            let render_surface = self.create_gfx_surface(
                surface,
                aligned_width,
                aligned_height,
                GfxSurfaceFlags::ALIGNED_SIZE | GfxSurfaceFlags::NO_HWACCEL_SESSIONS,
            )?;
            gfx_surface.override_render_surface(render_surface);
        }

        let _ = surface;
        Ok(gfx_surface)
    }

    /// Delete a wire surface
    ///
    /// Emits `DeleteEncodingContext` before `DeleteSurface` when a codec
    /// context is bound. The serial entry is freed immediately when no
    /// tracked frame references it, otherwise on the last matching ack or
    /// discard.
    pub fn delete_surface(&self, surface: &mut Surface, mut gfx_surface: GfxSurface) {
        if let Some(render_surface) = gfx_surface.take_render_surface() {
            self.delete_single_surface(surface, &gfx_surface);
            self.delete_single_surface(surface, &render_surface);
        } else {
            self.delete_single_surface(surface, &gfx_surface);
        }
    }

    fn delete_single_surface(&self, surface: &mut Surface, gfx_surface: &GfxSurface) {
        let surface_id = gfx_surface.surface_id();
        let codec_context_id = gfx_surface.codec_context_id();
        let surface_serial = gfx_surface.serial();

        debug!("Deleting surface with id {surface_id}");

        let needs_encoding_context_deletion = {
            let mut state = self.shared.gfx.lock();

            if let Some(surface_context) = state.serial_surface_table.get_mut(&surface_serial) {
                surface_context.surface_alive = false;
                surface_context.frame_controller = None;
                if surface_context.ref_count == 0 {
                    state.serial_surface_table.remove(&surface_serial);
                }
            }

            #[cfg(feature = "nvenc")]
            if let Some(hwaccel_context) = state.surface_hwaccel_table.remove(&surface_id) {
                debug!("Destroying NVENC session for surface {surface_id}");
                surface.needs_no_local_data = false;
                if let Some(hwaccel) = &self.shared.hwaccel {
                    hwaccel.free_nvenc_session(hwaccel_context.encode_session_id);
                }
            }

            state.surface_table.remove(&surface_id);
            state.codec_context_table.remove(&codec_context_id)
        };

        let _ = surface;

        if needs_encoding_context_deletion {
            let _ = self
                .shared
                .send(GfxPdu::DeleteEncodingContext(DeleteEncodingContextPdu {
                    surface_id,
                    codec_context_id,
                }));
        }

        let _ = self
            .shared
            .send(GfxPdu::DeleteSurface(DeleteSurfacePdu { surface_id }));
    }

    /// Reset the graphics output buffer after the virtual output changed
    ///
    /// Every existing wire surface is released and every codec context
    /// torn down before the ResetGraphics PDU goes out.
    pub fn reset_graphics(&self, width: u32, height: u32, monitors: Vec<Monitor>) -> Result<()> {
        debug!("Resetting graphics");

        self.delete_all_surfaces();
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);

        self.shared.send(GfxPdu::ResetGraphics(ResetGraphicsPdu {
            width,
            height,
            monitors,
        }))
    }

    fn delete_all_surfaces(&self) {
        let surface_ids: Vec<(u16, u32, u32)> = {
            let state = self.shared.gfx.lock();
            state
                .surface_table
                .iter()
                .map(|(&id, entry)| (id, entry.serial, entry.codec_context_id))
                .collect()
        };

        for (surface_id, serial, codec_context_id) in surface_ids {
            let needs_encoding_context_deletion = {
                let mut state = self.shared.gfx.lock();

                if let Some(surface_context) = state.serial_surface_table.get_mut(&serial) {
                    surface_context.surface_alive = false;
                    surface_context.frame_controller = None;
                    if surface_context.ref_count == 0 {
                        state.serial_surface_table.remove(&serial);
                    }
                }

                #[cfg(feature = "nvenc")]
                if let Some(hwaccel_context) = state.surface_hwaccel_table.remove(&surface_id) {
                    if let Some(hwaccel) = &self.shared.hwaccel {
                        hwaccel.free_nvenc_session(hwaccel_context.encode_session_id);
                    }
                }

                state.surface_table.remove(&surface_id);
                state.codec_context_table.remove(&codec_context_id)
            };

            if needs_encoding_context_deletion {
                let _ = self
                    .shared
                    .send(GfxPdu::DeleteEncodingContext(DeleteEncodingContextPdu {
                        surface_id,
                        codec_context_id,
                    }));
            }
            let _ = self
                .shared
                .send(GfxPdu::DeleteSurface(DeleteSurfacePdu { surface_id }));
        }
    }

    fn reset_pipeline_state(&self) {
        self.delete_all_surfaces();

        {
            let mut state = self.shared.gfx.lock();
            reduce_tracked_frame_infos(&mut state, 0);

            let serials: Vec<u32> = state.frame_serial_table.values().copied().collect();
            state.frame_serial_table.clear();
            for serial in serials {
                surface_serial_unref(&mut state, serial);
            }

            state.frame_acks_suspended = false;
            state.total_frames_encoded = 0;

            debug_assert!(state.surface_table.is_empty());
            debug_assert!(state.codec_context_table.is_empty());
            debug_assert!(state.frame_serial_table.is_empty());
            debug_assert!(state.serial_surface_table.is_empty());
            debug_assert!(state.encoded_frames.is_empty());
        }

        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
    }

    // =========================================================================
    // Frame emission
    // =========================================================================

    fn get_next_free_frame_id(&self, state: &mut GfxState) -> u32 {
        let mut frame_id = state.next_frame_id;
        while state.frame_serial_table.contains_key(&frame_id) {
            frame_id = frame_id.wrapping_add(1);
        }
        state.next_frame_id = frame_id.wrapping_add(1);
        frame_id
    }

    fn wall_clock_timestamp() -> Timestamp {
        let now = time::OffsetDateTime::now_utc();
        Timestamp {
            hours: u16::from(now.hour()),
            minutes: now.minute(),
            seconds: now.second(),
            milliseconds: now.millisecond(),
        }
    }

    /// Encode and emit the damaged region of `surface`
    ///
    /// Creates the wire surface (and pacing controller) on first demand
    /// and selects the codec: AVC420 when the hardware adapter holds a
    /// session for the surface and H.264 is negotiated, the progressive
    /// wavelet codec otherwise.
    pub fn refresh_gfx(
        &self,
        surface: &mut Surface,
        damage_rects: &[DamageRegion],
        buffer: &crate::buffer::Buffer,
    ) -> Result<()> {
        self.ensure_rtt_receivement();

        // drop wire surfaces that predate the last reset
        let current_epoch = self.shared.epoch.load(Ordering::Acquire);
        if let Some(gfx_surface) = &surface.gfx_surface {
            if gfx_surface.epoch() != current_epoch {
                surface.gfx_surface = None;
                surface.needs_no_local_data = false;
            }
        }

        if surface.gfx_surface.is_none() {
            surface.valid = false;
        }
        if !surface.valid {
            if let Some(stale) = surface.gfx_surface.take() {
                self.delete_surface(surface, stale);
            }
        }
        if surface.gfx_surface.is_none() {
            let mut gfx_surface = self.create_gfx_surface(
                surface,
                surface.width,
                surface.height,
                GfxSurfaceFlags::empty(),
            )?;

            let frame_controller = Arc::new(FrameController::new(surface.refresh_rate));
            {
                let mut state = self.shared.gfx.lock();
                if let Some(entry) = state.surface_table.get_mut(&gfx_surface.surface_id()) {
                    entry.frame_controller = Some(Arc::clone(&frame_controller));
                }
                if let Some(context) = state.serial_surface_table.get_mut(&gfx_surface.serial()) {
                    context.frame_controller = Some(Arc::clone(&frame_controller));
                }
            }
            gfx_surface.attach_frame_controller(frame_controller);
            gfx_surface.set_epoch(current_epoch);

            self.shared
                .send(GfxPdu::MapSurfaceToOutput(MapSurfaceToOutputPdu {
                    surface_id: gfx_surface.surface_id(),
                    output_origin_x: surface.output_origin_x,
                    output_origin_y: surface.output_origin_y,
                }))?;

            surface.gfx_surface = Some(gfx_surface);
        }

        #[cfg(feature = "nvenc")]
        {
            let surface_id = surface
                .gfx_surface
                .as_ref()
                .expect("wire surface exists")
                .surface_id();
            let use_avc = self.codec_caps().h264
                && self.shared.gfx.lock().surface_hwaccel_table.contains_key(&surface_id);
            if use_avc {
                return self.refresh_gfx_surface_avc420(surface, damage_rects, buffer);
            }
        }

        self.refresh_gfx_surface_progressive(surface, damage_rects, buffer)
    }

    fn record_emitted_frame(&self, gfx_surface: &GfxSurface, frame_id: u32) -> i64 {
        let controller = gfx_surface
            .frame_controller()
            .expect("controller attached at surface creation");
        let surface_serial = gfx_surface.serial();

        let mut state = self.shared.gfx.lock();
        let enc_ack_time_us = monotonic_time_us();
        controller.unack_frame(frame_id, enc_ack_time_us);

        state.frame_serial_table.insert(frame_id, surface_serial);
        surface_serial_ref(&mut state, surface_serial);
        state.total_frames_encoded = state.total_frames_encoded.wrapping_add(1);

        if state.frame_acks_suspended {
            controller.ack_frame(frame_id, enc_ack_time_us);
            enqueue_tracked_frame_info(&mut state, surface_serial, frame_id, enc_ack_time_us);
        }

        enc_ack_time_us
    }

    fn bracket_bw_measure_start(&self, payload_size: usize) -> bool {
        match &self.shared.network_autodetection {
            Some(autodetect) if payload_size >= MIN_BW_MEASURE_SIZE => {
                autodetect.try_bw_measure_start()
            }
            _ => false,
        }
    }

    fn bracket_bw_measure_stop(&self, pending: bool) {
        if pending {
            if let Some(autodetect) = &self.shared.network_autodetection {
                autodetect.queue_bw_measure_stop();
            }
        }
    }

    fn refresh_gfx_surface_progressive(
        &self,
        surface: &mut Surface,
        damage_rects: &[DamageRegion],
        buffer: &crate::buffer::Buffer,
    ) -> Result<()> {
        let gfx_surface = surface.gfx_surface.as_ref().expect("wire surface exists");
        let surface_id = gfx_surface.surface_id();
        let codec_context_id = gfx_surface.codec_context_id();

        let frame_data = buffer.local_data().ok_or_else(|| {
            GfxError::GraphicsSubsystemFailure("Framebuffer has no local data".into())
        })?;

        if !surface.valid {
            self.shared.encoder.lock().reset();
            surface.valid = true;
        }

        let needs_progressive_header = {
            let state = self.shared.gfx.lock();
            !state.codec_context_table.contains(&codec_context_id)
        };

        let bitmap_data = self.shared.encoder.lock().encode_region(
            frame_data,
            buffer.stride() as usize,
            surface.width,
            surface.height,
            damage_rects,
            needs_progressive_header,
        )?;

        let timestamp = Self::wall_clock_timestamp();
        let frame_id = {
            let mut state = self.shared.gfx.lock();
            if needs_progressive_header {
                state.codec_context_table.insert(codec_context_id);
            }
            self.get_next_free_frame_id(&mut state)
        };

        let payload_size = bitmap_data.len();
        let gfx_surface = surface.gfx_surface.as_ref().expect("wire surface exists");
        let enc_time_us = self.record_emitted_frame(gfx_surface, frame_id);

        let pending_bw_measure_stop = self.bracket_bw_measure_start(payload_size);

        self.shared
            .send(GfxPdu::StartFrame(StartFramePdu { timestamp, frame_id }))?;
        self.shared
            .send(GfxPdu::WireToSurface2(WireToSurface2Pdu {
                surface_id,
                codec_id: Codec2Type::RemoteFxProgressive,
                codec_context_id,
                pixel_format: PixelFormat::XRgb,
                bitmap_data,
            }))?;
        self.shared.send(GfxPdu::EndFrame(EndFramePdu { frame_id }))?;

        self.bracket_bw_measure_stop(pending_bw_measure_stop);

        self.track_enc_time(enc_time_us);

        Ok(())
    }

    #[cfg(feature = "nvenc")]
    fn refresh_gfx_surface_avc420(
        &self,
        surface: &mut Surface,
        damage_rects: &[DamageRegion],
        buffer: &crate::buffer::Buffer,
    ) -> Result<()> {
        use crate::buffer::GpuMapping;

        let hwaccel = self
            .shared
            .hwaccel
            .as_ref()
            .ok_or_else(|| GfxError::GraphicsSubsystemFailure("No hardware adapter".into()))?;

        let gfx_surface = surface.gfx_surface.as_ref().expect("wire surface exists");
        let surface_id = gfx_surface.surface_id();
        let render_surface_id = gfx_surface.render_surface().surface_id();
        let has_render_surface = gfx_surface.has_render_surface();

        if !surface.valid {
            surface.valid = true;
        }

        let src_data = match buffer.gpu_mapping() {
            Some(GpuMapping::Cuda(pointer)) => pointer,
            _ => {
                return Err(GfxError::GraphicsSubsystemFailure(
                    "Framebuffer has no CUDA mapping".into(),
                ))
            }
        };

        let (encode_session_id, has_first_frame) = {
            let state = self.shared.gfx.lock();
            let context = state
                .surface_hwaccel_table
                .get(&surface_id)
                .expect("AVC420 path requires an NVENC session");
            (context.encode_session_id, context.has_first_frame)
        };

        let aligned_width = crate::hwaccel::aligned_size(u32::from(surface.width), 16);
        let aligned_height = crate::hwaccel::aligned_size(u32::from(surface.height), 64);

        let stream = hwaccel
            .create_stream()
            .map_err(|e| GfxError::GraphicsSubsystemFailure(e.to_string()))?;
        hwaccel
            .avc420_encode_bgrx_frame(
                encode_session_id,
                src_data,
                u32::from(surface.width),
                u32::from(surface.height),
                aligned_width,
                aligned_height,
                &stream,
            )
            .map_err(|e| GfxError::GraphicsSubsystemFailure(format!("Failed to encode YUV420 frame: {e}")))?;

        let avc_data = hwaccel
            .avc420_retrieve_bitstream(encode_session_id)
            .map_err(|e| GfxError::GraphicsSubsystemFailure(format!("Failed to retrieve AVC420 bitstream: {e}")))?;

        let command = super::avc::compose_avc420_command(
            render_surface_id,
            damage_rects,
            has_first_frame,
            &avc_data,
        )?;
        {
            let mut state = self.shared.gfx.lock();
            if let Some(context) = state.surface_hwaccel_table.get_mut(&surface_id) {
                context.has_first_frame = true;
            }
        }

        let timestamp = Self::wall_clock_timestamp();
        let frame_id = {
            let mut state = self.shared.gfx.lock();
            self.get_next_free_frame_id(&mut state)
        };

        let gfx_surface = surface.gfx_surface.as_ref().expect("wire surface exists");
        let enc_time_us = self.record_emitted_frame(gfx_surface, frame_id);

        let payload_size = super::avc::avc420_payload_size(damage_rects.len(), avc_data.len());
        let pending_bw_measure_stop = self.bracket_bw_measure_start(payload_size);

        self.shared
            .send(GfxPdu::StartFrame(StartFramePdu { timestamp, frame_id }))?;
        self.shared.send(GfxPdu::WireToSurface1(command))?;

        if has_render_surface {
            self.blit_surface_to_surface(surface_id, render_surface_id, damage_rects)?;
        }

        self.shared.send(GfxPdu::EndFrame(EndFramePdu { frame_id }))?;

        self.bracket_bw_measure_stop(pending_bw_measure_stop);
        self.track_enc_time(enc_time_us);

        Ok(())
    }

    /// Copy each damage rectangle from the aligned render surface to the
    /// visible surface
    #[cfg_attr(not(feature = "nvenc"), allow(dead_code))]
    fn blit_surface_to_surface(
        &self,
        destination_surface_id: u16,
        source_surface_id: u16,
        rects: &[DamageRegion],
    ) -> Result<()> {
        for rect in rects {
            self.shared
                .send(GfxPdu::SurfaceToSurface(SurfaceToSurfacePdu {
                    source_surface_id,
                    destination_surface_id,
                    source_rectangle: InclusiveRectangle {
                        left: rect.x as u16,
                        top: rect.y as u16,
                        right: (rect.x + rect.width - 1) as u16,
                        bottom: (rect.y + rect.height - 1) as u16,
                    },
                    destination_points: vec![Point {
                        x: rect.x as u16,
                        y: rect.y as u16,
                    }],
                }))?;
        }

        Ok(())
    }

    // =========================================================================
    // Acknowledgements
    // =========================================================================

    /// Handle a FrameAcknowledge PDU from the peer
    pub fn handle_frame_acknowledge(&self, ack: &FrameAcknowledgePdu) {
        let samples = {
            let mut state = self.shared.gfx.lock();
            self.handle_frame_ack_event(&mut state, ack)
        };

        if let Some(autodetect) = &self.shared.network_autodetection {
            for sample in samples {
                autodetect.push_round_trip_sample(sample);
            }
        }
    }

    fn handle_frame_ack_event(
        &self,
        state: &mut GfxState,
        ack: &FrameAcknowledgePdu,
    ) -> Vec<Duration> {
        let pending_frame_acks = state
            .total_frames_encoded
            .wrapping_sub(ack.total_frames_decoded);

        if pending_frame_acks as usize <= MAX_TRACKED_ENC_FRAMES
            && !state.frame_serial_table.contains_key(&ack.frame_id)
        {
            // stale acknowledgement for an already-displaced frame
            return Vec::new();
        }

        maybe_rewrite_frame_history(state, pending_frame_acks);
        if ack.queue_depth != QueueDepth::Suspend {
            state.frame_acks_suspended = false;
        }

        let mut samples = Vec::new();
        if let Some(surface_serial) = state.frame_serial_table.remove(&ack.frame_id) {
            let controller = state
                .serial_surface_table
                .get(&surface_serial)
                .expect("tracked frame references a live serial entry")
                .frame_controller
                .clone();

            if let Some(controller) = controller {
                samples = controller.ack_frame(ack.frame_id, monotonic_time_us());
            }

            surface_serial_unref(state, surface_serial);
        }

        if ack.queue_depth == QueueDepth::Suspend {
            suspend_frame_acknowledgement(state);
        }

        samples
    }

    /// Fan a fresh round-trip time out to every surface's pacing controller
    pub fn notify_new_round_trip_time(&self, round_trip_time: Duration) {
        let state = self.shared.gfx.lock();
        for entry in state.surface_table.values() {
            if let Some(controller) = &entry.frame_controller {
                controller.notify_new_round_trip_time(round_trip_time);
            }
        }
    }

    // =========================================================================
    // RTT necessity voting
    // =========================================================================

    fn track_enc_time(&self, enc_time_us: i64) {
        let mut state = self.shared.gfx.lock();
        clear_old_enc_times(&mut state, monotonic_time_us());
        state.enc_times.push_back(enc_time_us);
        drop(state);

        self.ensure_rtt_receivement();
    }

    /// Vote HIGH while frames were encoded within the last second; a
    /// recurring check downgrades to LOW when activity stops
    fn ensure_rtt_receivement(&self) {
        let Some(autodetect) = &self.shared.network_autodetection else {
            return;
        };

        {
            let mut state = self.shared.gfx.lock();
            if state.rtt_pause_active {
                return;
            }
            state.rtt_pause_active = true;
        }

        autodetect.set_rtt_consumer_necessity(RttConsumer::Rdpgfx, RttNecessity::High);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ENC_TIMES_CHECK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;

                let mut state = shared.gfx.lock();
                clear_old_enc_times(&mut state, monotonic_time_us());
                if state.enc_times.is_empty() {
                    state.rtt_pause_active = false;
                    drop(state);

                    if let Some(autodetect) = &shared.network_autodetection {
                        autodetect
                            .set_rtt_consumer_necessity(RttConsumer::Rdpgfx, RttNecessity::Low);
                    }
                    return;
                }
            }
        });
    }
}

// =============================================================================
// Frame-info bookkeeping (under the gfx mutex)
// =============================================================================

fn surface_serial_ref(state: &mut GfxState, surface_serial: u32) {
    state
        .serial_surface_table
        .get_mut(&surface_serial)
        .expect("serial entry exists while frames reference it")
        .ref_count += 1;
}

fn surface_serial_unref(state: &mut GfxState, surface_serial: u32) {
    let context = state
        .serial_surface_table
        .get_mut(&surface_serial)
        .expect("serial entry exists while frames reference it");

    assert!(context.ref_count > 0);
    context.ref_count -= 1;

    if !context.surface_alive && context.ref_count == 0 {
        state.serial_surface_table.remove(&surface_serial);
    }
}

fn gfx_frame_info_free(state: &mut GfxState, frame_info: GfxFrameInfo) {
    state.frame_serial_table.remove(&frame_info.frame_id);
    surface_serial_unref(state, frame_info.surface_serial);
}

fn reduce_tracked_frame_infos(state: &mut GfxState, max_tracked_frames: usize) {
    while state.encoded_frames.len() > max_tracked_frames {
        let frame_info = state.encoded_frames.pop_front().expect("queue not empty");
        gfx_frame_info_free(state, frame_info);
    }
}

fn enqueue_tracked_frame_info(
    state: &mut GfxState,
    surface_serial: u32,
    frame_id: u32,
    enc_time_us: i64,
) {
    reduce_tracked_frame_infos(state, MAX_TRACKED_ENC_FRAMES - 1);

    state.encoded_frames.push_back(GfxFrameInfo {
        frame_id,
        enc_time_us,
        surface_serial,
    });
}

/// Re-unack the tracked tail so the pacing controllers reflect the true
/// outstanding window; entries keep their frame-serial records for the
/// matching acknowledgement
fn maybe_rewrite_frame_history(state: &mut GfxState, pending_frame_acks: u32) {
    if state.encoded_frames.is_empty() {
        return;
    }

    reduce_tracked_frame_infos(state, pending_frame_acks as usize + 1);

    while let Some(frame_info) = state.encoded_frames.pop_back() {
        let controller = state
            .serial_surface_table
            .get(&frame_info.surface_serial)
            .expect("tracked frame references a live serial entry")
            .frame_controller
            .clone();

        if let Some(controller) = controller {
            controller.unack_last_acked_frame(frame_info.frame_id, frame_info.enc_time_us);
        }
    }
}

fn suspend_frame_acknowledgement(state: &mut GfxState) {
    state.frame_acks_suspended = true;

    for entry in state.surface_table.values() {
        if let Some(controller) = &entry.frame_controller {
            controller.clear_all_unacked();
        }
    }

    reduce_tracked_frame_infos(state, 0);

    let serials: Vec<u32> = state.frame_serial_table.values().copied().collect();
    state.frame_serial_table.clear();
    for serial in serials {
        surface_serial_unref(state, serial);
    }
}

fn clear_old_enc_times(state: &mut GfxState, current_time_us: i64) {
    while let Some(&enc_time_us) = state.enc_times.front() {
        if current_time_us - enc_time_us >= 1_000_000 {
            state.enc_times.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironrdp_egfx::pdu::{CapabilitiesV104Flags, CapabilitiesV10Flags, CapabilitiesV8Flags};
    use std::sync::mpsc;

    struct RecordingSink {
        sent: mpsc::Sender<GfxPdu>,
    }

    impl GfxPduSink for RecordingSink {
        fn send(&mut self, pdu: GfxPdu) -> Result<()> {
            self.sent.send(pdu).ok();
            Ok(())
        }
    }

    fn pipeline_with_sink() -> (GraphicsPipeline, mpsc::Receiver<GfxPdu>, mpsc::Receiver<PipelineEvent>) {
        let (pdu_tx, pdu_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let pipeline = GraphicsPipeline::new(
            RecordingSink { sent: pdu_tx },
            move |event| {
                event_tx.send(event).ok();
            },
            None,
        );
        (pipeline, pdu_rx, event_rx)
    }

    fn advertise(caps: Vec<CapabilitySet>) -> GfxPdu {
        GfxPdu::CapabilitiesAdvertise(CapabilitiesAdvertisePdu(caps))
    }

    fn drain<T>(rx: &mpsc::Receiver<T>) -> Vec<T> {
        rx.try_iter().collect()
    }

    fn test_surface() -> Surface {
        Surface::new(64, 64, 0, 0, 30)
    }

    fn test_buffer(pool: &crate::buffer::BufferPool) -> crate::buffer::PooledBuffer {
        pool.acquire()
    }

    fn negotiated_pipeline() -> (GraphicsPipeline, mpsc::Receiver<GfxPdu>, mpsc::Receiver<PipelineEvent>) {
        let (pipeline, pdu_rx, event_rx) = pipeline_with_sink();
        pipeline
            .handle_pdu(advertise(vec![CapabilitySet::V10_4 {
                flags: CapabilitiesV104Flags::SMALL_CACHE,
            }]))
            .unwrap();
        drain(&pdu_rx);
        drain(&event_rx);
        (pipeline, pdu_rx, event_rx)
    }

    fn refresh_full_surface(
        pipeline: &GraphicsPipeline,
        surface: &mut Surface,
        buffer: &crate::buffer::Buffer,
    ) {
        let rects = [DamageRegion::new(0, 0, 64, 64)];
        pipeline.refresh_gfx(surface, &rects, buffer).unwrap();
    }

    #[tokio::test]
    async fn caps_selection_prefers_highest_version() {
        let (pipeline, pdu_rx, event_rx) = pipeline_with_sink();

        // S5: {8.0, 10, 10.4} with AVC enabled selects 10.4
        pipeline
            .handle_pdu(advertise(vec![
                CapabilitySet::V8 { flags: CapabilitiesV8Flags::empty() },
                CapabilitySet::V10 { flags: CapabilitiesV10Flags::empty() },
                CapabilitySet::V10_4 { flags: CapabilitiesV104Flags::SMALL_CACHE },
            ]))
            .unwrap();

        let sent = drain(&pdu_rx);
        assert!(matches!(
            &sent[..],
            [GfxPdu::CapabilitiesConfirm(CapabilitiesConfirmPdu(CapabilitySet::V10_4 { .. }))]
        ));

        let caps = pipeline.codec_caps();
        assert!(caps.h264);
        assert!(caps.avc444v2);

        let events = drain(&event_rx);
        assert!(matches!(events[0], PipelineEvent::Reset));
        assert!(matches!(events[1], PipelineEvent::Ready));
    }

    #[tokio::test]
    async fn caps_without_supported_version_fails() {
        let (pipeline, _pdu_rx, event_rx) = pipeline_with_sink();

        let result = pipeline.handle_pdu(advertise(vec![CapabilitySet::Unknown(vec![0u8; 4])]));
        assert!(matches!(result, Err(GfxError::CapabilityMismatch(_))));
        assert!(matches!(
            drain(&event_rx)[..],
            [PipelineEvent::SessionError(GfxError::CapabilityMismatch(_))]
        ));
    }

    #[tokio::test]
    async fn readvertise_below_103_is_a_violation() {
        let (pipeline, pdu_rx, _event_rx) = pipeline_with_sink();

        // S6: initial version 10.1 forbids any re-advertise
        pipeline
            .handle_pdu(advertise(vec![CapabilitySet::V10_1]))
            .unwrap();
        drain(&pdu_rx);

        let result = pipeline.handle_pdu(advertise(vec![CapabilitySet::V8 {
            flags: CapabilitiesV8Flags::empty(),
        }]));
        assert!(matches!(result, Err(GfxError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn readvertise_disabling_avc_is_rejected() {
        let (pipeline, pdu_rx, _event_rx) = pipeline_with_sink();

        pipeline
            .handle_pdu(advertise(vec![CapabilitySet::V10_4 {
                flags: CapabilitiesV104Flags::SMALL_CACHE,
            }]))
            .unwrap();
        drain(&pdu_rx);

        // legal re-advertise (initial version >= 10.3) but AVC now disabled
        let result = pipeline.handle_pdu(advertise(vec![CapabilitySet::V10_4 {
            flags: CapabilitiesV104Flags::AVC_DISABLED,
        }]));
        assert!(matches!(result, Err(GfxError::CapabilityMismatch(_))));

        // re-advertise keeping AVC is accepted and resets the pipeline
        pipeline
            .handle_pdu(advertise(vec![CapabilitySet::V10_5 {
                flags: CapabilitiesV104Flags::SMALL_CACHE,
            }]))
            .unwrap();
        let sent = drain(&pdu_rx);
        assert!(sent
            .iter()
            .any(|pdu| matches!(pdu, GfxPdu::CapabilitiesConfirm(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_timeout_tears_down_session() {
        let (pipeline, _pdu_rx, event_rx) = pipeline_with_sink();

        pipeline.notify_channel_opened();
        tokio::time::sleep(PROTOCOL_TIMEOUT + Duration::from_millis(10)).await;

        assert!(matches!(
            drain(&event_rx)[..],
            [PipelineEvent::SessionError(GfxError::CapabilityMismatch(_))]
        ));
    }

    #[tokio::test]
    async fn first_refresh_creates_and_maps_surface() {
        let (pipeline, pdu_rx, _event_rx) = negotiated_pipeline();

        let pool = crate::buffer::BufferPool::new(1);
        pool.resize_buffers(64, 64, 64 * 4).unwrap();
        let buffer = test_buffer(&pool);
        let mut surface = test_surface();

        refresh_full_surface(&pipeline, &mut surface, &buffer);

        let sent = drain(&pdu_rx);
        assert!(matches!(sent[0], GfxPdu::CreateSurface(CreateSurfacePdu { width: 64, height: 64, .. })));
        assert!(matches!(sent[1], GfxPdu::MapSurfaceToOutput(_)));
        assert!(matches!(sent[2], GfxPdu::StartFrame(_)));
        assert!(matches!(sent[3], GfxPdu::WireToSurface2(_)));
        assert!(matches!(sent[4], GfxPdu::EndFrame(_)));

        assert!(surface.valid);
        let controller = surface
            .gfx_surface
            .as_ref()
            .unwrap()
            .frame_controller()
            .unwrap();
        assert_eq!(controller.n_unacked_frames(), 1);

        // second refresh reuses surface and codec context
        refresh_full_surface(&pipeline, &mut surface, &buffer);
        let sent = drain(&pdu_rx);
        assert!(matches!(sent[0], GfxPdu::StartFrame(_)));
    }

    #[tokio::test]
    async fn frame_ids_are_unique_across_live_window() {
        let (pipeline, _pdu_rx, _event_rx) = negotiated_pipeline();

        let pool = crate::buffer::BufferPool::new(1);
        pool.resize_buffers(64, 64, 64 * 4).unwrap();
        let buffer = test_buffer(&pool);
        let mut surface = test_surface();

        // wrap the cursor just below u32::MAX and verify probing skips
        // still-tracked ids
        refresh_full_surface(&pipeline, &mut surface, &buffer);
        {
            let mut state = pipeline.shared.gfx.lock();
            state.next_frame_id = 0;
            // frame id 0 was assigned to the first frame and is tracked
            assert!(state.frame_serial_table.contains_key(&0));
        }
        refresh_full_surface(&pipeline, &mut surface, &buffer);
        {
            let state = pipeline.shared.gfx.lock();
            assert!(state.frame_serial_table.contains_key(&1));
            assert_eq!(state.frame_serial_table.len(), 2);
        }
    }

    #[tokio::test]
    async fn ack_releases_frame_and_feeds_controller() {
        let (pipeline, _pdu_rx, _event_rx) = negotiated_pipeline();

        let pool = crate::buffer::BufferPool::new(1);
        pool.resize_buffers(64, 64, 64 * 4).unwrap();
        let buffer = test_buffer(&pool);
        let mut surface = test_surface();

        refresh_full_surface(&pipeline, &mut surface, &buffer);

        pipeline.handle_frame_acknowledge(&FrameAcknowledgePdu {
            queue_depth: QueueDepth::Unavailable,
            frame_id: 0,
            total_frames_decoded: 1,
        });

        let controller = surface
            .gfx_surface
            .as_ref()
            .unwrap()
            .frame_controller()
            .unwrap();
        assert_eq!(controller.n_unacked_frames(), 0);

        let state = pipeline.shared.gfx.lock();
        assert!(state.frame_serial_table.is_empty());
    }

    #[tokio::test]
    async fn suspension_latch_self_acks_subsequent_frames() {
        let (pipeline, _pdu_rx, _event_rx) = negotiated_pipeline();

        let pool = crate::buffer::BufferPool::new(1);
        pool.resize_buffers(64, 64, 64 * 4).unwrap();
        let buffer = test_buffer(&pool);
        let mut surface = test_surface();

        refresh_full_surface(&pipeline, &mut surface, &buffer);

        // S4: suspend ack clears all unacked frames and latches
        pipeline.handle_frame_acknowledge(&FrameAcknowledgePdu {
            queue_depth: QueueDepth::Suspend,
            frame_id: 0,
            total_frames_decoded: 1,
        });
        assert!(pipeline.is_frame_ack_suspended());

        let controller = Arc::clone(
            surface
                .gfx_surface
                .as_ref()
                .unwrap()
                .frame_controller()
                .unwrap(),
        );
        assert_eq!(controller.n_unacked_frames(), 0);

        // every further encode self-acks at encode time
        refresh_full_surface(&pipeline, &mut surface, &buffer);
        refresh_full_surface(&pipeline, &mut surface, &buffer);
        assert_eq!(controller.n_unacked_frames(), 0);
        assert_eq!(pipeline.tracked_frame_count(), 2);
    }

    #[tokio::test]
    async fn ack_window_rewrite_restores_unacked_tail() {
        let (pipeline, _pdu_rx, _event_rx) = negotiated_pipeline();

        let pool = crate::buffer::BufferPool::new(1);
        pool.resize_buffers(64, 64, 64 * 4).unwrap();
        let buffer = test_buffer(&pool);
        let mut surface = test_surface();

        refresh_full_surface(&pipeline, &mut surface, &buffer);
        pipeline.handle_frame_acknowledge(&FrameAcknowledgePdu {
            queue_depth: QueueDepth::Suspend,
            frame_id: 0,
            total_frames_decoded: 1,
        });

        // S3: a burst of self-acked frames keeps the tracked window bounded
        for _ in 0..(MAX_TRACKED_ENC_FRAMES + 200) {
            refresh_full_surface(&pipeline, &mut surface, &buffer);
        }
        assert_eq!(pipeline.tracked_frame_count(), MAX_TRACKED_ENC_FRAMES);

        let last_frame_id = {
            let state = pipeline.shared.gfx.lock();
            state.encoded_frames.back().unwrap().frame_id
        };

        // a real ack rewrites history: the whole tail is re-unacked
        pipeline.handle_frame_acknowledge(&FrameAcknowledgePdu {
            queue_depth: QueueDepth::AvailableBytes(1),
            frame_id: last_frame_id,
            total_frames_decoded: 1,
        });

        assert!(!pipeline.is_frame_ack_suspended());
        assert_eq!(pipeline.tracked_frame_count(), 0);

        let controller = surface
            .gfx_surface
            .as_ref()
            .unwrap()
            .frame_controller()
            .unwrap();
        // all re-unacked entries minus the one acknowledged by frame id
        assert_eq!(controller.n_unacked_frames(), MAX_TRACKED_ENC_FRAMES - 1);
    }

    #[tokio::test]
    async fn stale_ack_is_ignored() {
        let (pipeline, _pdu_rx, _event_rx) = negotiated_pipeline();

        let pool = crate::buffer::BufferPool::new(1);
        pool.resize_buffers(64, 64, 64 * 4).unwrap();
        let buffer = test_buffer(&pool);
        let mut surface = test_surface();

        refresh_full_surface(&pipeline, &mut surface, &buffer);

        pipeline.handle_frame_acknowledge(&FrameAcknowledgePdu {
            queue_depth: QueueDepth::Unavailable,
            frame_id: 999,
            total_frames_decoded: 1,
        });

        let state = pipeline.shared.gfx.lock();
        assert_eq!(state.frame_serial_table.len(), 1);
    }

    #[tokio::test]
    async fn serial_entry_survives_surface_deletion_until_last_ack() {
        let (pipeline, _pdu_rx, _event_rx) = negotiated_pipeline();

        let pool = crate::buffer::BufferPool::new(1);
        pool.resize_buffers(64, 64, 64 * 4).unwrap();
        let buffer = test_buffer(&pool);
        let mut surface = test_surface();

        refresh_full_surface(&pipeline, &mut surface, &buffer);
        let serial = surface.gfx_surface.as_ref().unwrap().serial();

        // delete the surface while one frame is still tracked
        let gfx_surface = surface.gfx_surface.take().unwrap();
        pipeline.delete_surface(&mut surface, gfx_surface);

        {
            let state = pipeline.shared.gfx.lock();
            let context = state.serial_surface_table.get(&serial).unwrap();
            assert!(!context.surface_alive);
            assert_eq!(context.ref_count, 1);
        }

        pipeline.handle_frame_acknowledge(&FrameAcknowledgePdu {
            queue_depth: QueueDepth::Unavailable,
            frame_id: 0,
            total_frames_decoded: 1,
        });

        let state = pipeline.shared.gfx.lock();
        assert!(state.serial_surface_table.is_empty());
    }

    #[tokio::test]
    async fn reset_graphics_deletes_surfaces_first() {
        let (pipeline, pdu_rx, _event_rx) = negotiated_pipeline();

        let pool = crate::buffer::BufferPool::new(1);
        pool.resize_buffers(64, 64, 64 * 4).unwrap();
        let buffer = test_buffer(&pool);
        let mut surface = test_surface();

        refresh_full_surface(&pipeline, &mut surface, &buffer);
        drain(&pdu_rx);

        let epoch_before = pipeline.epoch();
        pipeline
            .reset_graphics(
                1024,
                768,
                vec![Monitor {
                    left: 0,
                    top: 0,
                    right: 1023,
                    bottom: 767,
                    flags: ironrdp_pdu::gcc::MonitorFlags::PRIMARY,
                }],
            )
            .unwrap();

        let sent = drain(&pdu_rx);
        // the surface has a bound codec context: encoding context deletion
        // precedes surface deletion, reset comes last
        assert!(matches!(sent[0], GfxPdu::DeleteEncodingContext(_)));
        assert!(matches!(sent[1], GfxPdu::DeleteSurface(_)));
        assert!(matches!(sent.last(), Some(GfxPdu::ResetGraphics(_))));

        assert_eq!(pipeline.epoch(), epoch_before + 1);

        // the stale wire surface is detected and recreated on next refresh
        refresh_full_surface(&pipeline, &mut surface, &buffer);
        let sent = drain(&pdu_rx);
        assert!(matches!(sent[0], GfxPdu::CreateSurface(_)));
    }

    #[tokio::test]
    async fn cache_import_offer_gets_empty_reply() {
        let (pipeline, pdu_rx, _event_rx) = negotiated_pipeline();

        pipeline
            .handle_pdu(GfxPdu::CacheImportOffer(ironrdp_egfx::pdu::CacheImportOfferPdu {
                cache_entries: vec![],
            }))
            .unwrap();

        let sent = drain(&pdu_rx);
        assert!(matches!(&sent[..], [GfxPdu::CacheImportReply(_)]));
    }
}
