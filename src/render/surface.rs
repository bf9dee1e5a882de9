//! Remote surface state
//!
//! A [`Surface`] is one logical remote display: dimensions, an output
//! origin, and the codec-facing state the graphics pipeline maintains on
//! it. The `valid` flag is cleared whenever the surface must retransmit a
//! full frame (after a reset, an invalidation, or a codec-context
//! deletion); the pipeline recreates the wire surface on the next refresh.

use crate::egfx::GfxSurface;

/// One logical remote display
pub struct Surface {
    /// Surface width in pixels
    pub width: u16,
    /// Surface height in pixels
    pub height: u16,
    /// X position within the graphics output buffer
    pub output_origin_x: u32,
    /// Y position within the graphics output buffer
    pub output_origin_y: u32,
    /// Negotiated refresh rate in Hz
    pub refresh_rate: u32,

    /// Cleared when the next frame must cover the whole surface
    pub valid: bool,

    /// Wire surface; created on first demand, dropped on reset
    pub gfx_surface: Option<GfxSurface>,

    /// The encoder consumes GPU memory directly; no CPU-side pixel data
    /// is required for this surface
    pub needs_no_local_data: bool,
}

impl Surface {
    /// Create a surface of the given geometry
    pub fn new(width: u16, height: u16, output_origin_x: u32, output_origin_y: u32, refresh_rate: u32) -> Self {
        Self {
            width,
            height,
            output_origin_x,
            output_origin_y,
            refresh_rate,
            valid: false,
            gfx_surface: None,
            needs_no_local_data: false,
        }
    }
}
