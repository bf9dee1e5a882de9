//! GPU Acceleration Adapters
//!
//! Thin façades over vendor GPU stacks, exposing a capability set instead of
//! a vendor API:
//!
//! - `nvidia` (`nvenc` feature): CUDA + NVENC. Produces AVC420 bitstreams
//!   from BGRX device memory via an NV12 conversion kernel and runs the
//!   CUDA damage-detection kernels.
//! - `vulkan` (`vulkan` feature): dma-buf importing Vulkan path for
//!   zero-copy capture ingestion.
//!
//! Consumers query [`HwAccelCaps`] and never touch vendor types directly.

use thiserror::Error;

#[cfg(feature = "nvenc")]
pub mod nvidia;
#[cfg(feature = "vulkan")]
pub mod vulkan;

/// Errors produced by the GPU adapters
#[derive(Debug, Error)]
pub enum HwAccelError {
    /// Vendor runtime could not be initialized
    #[error("Hardware acceleration unavailable: {0}")]
    Unavailable(String),

    /// Kernel module load or launch failed
    #[error("GPU kernel failure: {0}")]
    KernelFailure(String),

    /// Encoder session operation failed
    #[error("Encode session failure: {0}")]
    EncodeFailure(String),

    /// Device memory operation failed
    #[error("GPU memory failure: {0}")]
    MemoryFailure(String),

    /// Buffer import (dma-buf, graphics resource) failed
    #[error("GPU import failure: {0}")]
    ImportFailure(String),
}

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, HwAccelError>;

/// Capabilities offered by the available GPU adapters
#[derive(Debug, Clone, Copy, Default)]
pub struct HwAccelCaps {
    /// AVC420 hardware encode sessions can be created
    pub avc420_encode: bool,
    /// Damage detection can run on the GPU
    pub gpu_damage_detection: bool,
    /// dma-buf framebuffers can be imported without a CPU copy
    pub dmabuf_import: bool,
}

/// Round `size` up to a multiple of `alignment`
#[inline]
pub fn aligned_size(size: u32, alignment: u32) -> u32 {
    size + if size % alignment != 0 { alignment - size % alignment } else { 0 }
}
