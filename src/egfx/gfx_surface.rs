//! Wire-visible surfaces
//!
//! A [`GfxSurface`] is the graphics pipeline's handle to one surface
//! created on the client: a 16-bit server-assigned surface id plus a
//! 32-bit serial that stays unique for the lifetime of the session. The
//! serial associates unacked frames with their surface even after the
//! surface id has been reused.

use std::sync::Arc;

use bitflags::bitflags;

use super::frame_controller::FrameController;

bitflags! {
    /// Surface creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GfxSurfaceFlags: u32 {
        /// Surface dimensions are encoder-aligned, not the visible size
        const ALIGNED_SIZE = 0x1;
        /// Never create a hardware encode session for this surface
        const NO_HWACCEL_SESSIONS = 0x2;
    }
}

/// One wire-visible surface
pub struct GfxSurface {
    surface_id: u16,
    codec_context_id: u32,
    serial: u32,
    width: u16,
    height: u16,
    flags: GfxSurfaceFlags,

    frame_controller: Option<Arc<FrameController>>,

    /// Aligned-size auxiliary surface the encoder renders into; damage
    /// rectangles are blitted back to this (the visible) surface
    render_surface: Option<Box<GfxSurface>>,

    /// Pipeline epoch at creation; a mismatch marks the surface stale
    epoch: u64,
}

impl GfxSurface {
    pub(crate) fn new(
        surface_id: u16,
        serial: u32,
        width: u16,
        height: u16,
        flags: GfxSurfaceFlags,
    ) -> Self {
        Self {
            surface_id,
            // same id as the surface; only relevant for WireToSurface2 PDUs
            codec_context_id: u32::from(surface_id),
            serial,
            width,
            height,
            flags,
            frame_controller: None,
            render_surface: None,
            epoch: 0,
        }
    }

    /// Pipeline epoch recorded at creation
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Wire surface id
    pub fn surface_id(&self) -> u16 {
        self.surface_id
    }

    /// Codec context id used for progressive WireToSurface2 commands
    pub fn codec_context_id(&self) -> u32 {
        self.codec_context_id
    }

    /// Lifetime-unique serial
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Surface width in pixels
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Surface height in pixels
    pub fn height(&self) -> u16 {
        self.height
    }

    /// Whether this surface is an aligned-size auxiliary surface
    pub fn is_auxiliary_surface(&self) -> bool {
        self.flags.contains(GfxSurfaceFlags::ALIGNED_SIZE)
    }

    /// Whether hardware encode sessions are disallowed for this surface
    pub fn disallows_hwaccel_sessions(&self) -> bool {
        self.flags.contains(GfxSurfaceFlags::NO_HWACCEL_SESSIONS)
    }

    pub(crate) fn attach_frame_controller(&mut self, frame_controller: Arc<FrameController>) {
        assert!(self.frame_controller.is_none());
        self.frame_controller = Some(frame_controller);
    }

    /// The pacing controller, present on main surfaces once rendering started
    pub fn frame_controller(&self) -> Option<&Arc<FrameController>> {
        self.frame_controller.as_ref()
    }

    pub(crate) fn override_render_surface(&mut self, render_surface: GfxSurface) {
        self.render_surface = Some(Box::new(render_surface));
    }

    pub(crate) fn take_render_surface(&mut self) -> Option<Box<GfxSurface>> {
        self.render_surface.take()
    }

    /// The surface encode targets: the auxiliary render surface when one
    /// exists, otherwise this surface itself
    pub fn render_surface(&self) -> &GfxSurface {
        self.render_surface.as_deref().unwrap_or(self)
    }

    /// Whether a separate render surface is attached
    pub fn has_render_surface(&self) -> bool {
        self.render_surface.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_context_id_matches_surface_id() {
        let surface = GfxSurface::new(42, 7, 800, 600, GfxSurfaceFlags::empty());
        assert_eq!(surface.codec_context_id(), 42);
        assert_eq!(surface.serial(), 7);
        assert!(!surface.is_auxiliary_surface());
    }

    #[test]
    fn render_surface_defaults_to_self() {
        let mut surface = GfxSurface::new(1, 1, 800, 600, GfxSurfaceFlags::empty());
        assert_eq!(surface.render_surface().surface_id(), 1);

        let aux = GfxSurface::new(
            2,
            2,
            800,
            640,
            GfxSurfaceFlags::ALIGNED_SIZE | GfxSurfaceFlags::NO_HWACCEL_SESSIONS,
        );
        surface.override_render_surface(aux);
        assert_eq!(surface.render_surface().surface_id(), 2);
        assert!(surface.render_surface().is_auxiliary_surface());
    }
}
