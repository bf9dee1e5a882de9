//! Surface rendering
//!
//! The render side of the capture-to-wire pipeline: a [`Surface`] models
//! one logical remote display, a [`SurfaceRenderer`] moves captured
//! framebuffers through view creation and damage detection into the
//! graphics pipeline, and [`view_creator`] produces the encoder's view of
//! each frame.

mod surface;
mod surface_renderer;
pub mod view_creator;

pub use surface::Surface;
pub use surface_renderer::{
    RegisteredBufferType, RendererError, SurfaceRenderer, DRM_FORMAT_MOD_INVALID,
};
pub use view_creator::{DirectViewCreator, ViewCreator, ViewError};
