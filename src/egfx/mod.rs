//! RDP Graphics Pipeline Extension (MS-RDPEGFX), server side
//!
//! The graphics pipeline turns rendered framebuffers into an encoded,
//! incrementally updated bitmap stream on a dynamic virtual channel:
//!
//! ```text
//! surface renderer ─ damage region ─┐
//!                                   ▼
//!                     GraphicsPipeline::refresh_gfx
//!                        │ progressive wavelet  (CPU)
//!                        │ AVC420 via NVENC     (GPU, nvenc feature)
//!                        ▼
//!       StartFrame · WireToSurface · EndFrame ──► DVC ──► client
//!                        ▲
//!       FrameAcknowledge / QoeFrameAcknowledge ◄─────────┘
//! ```
//!
//! Responsibilities split across this module:
//! - [`pipeline`]: capability negotiation, surface and codec-context
//!   lifecycle, frame-id allocation, ack tracking, suspension semantics,
//!   history rewriting on out-of-window acks.
//! - [`frame_controller`]: per-surface unacked window and submission
//!   throttling from round-trip-time samples.
//! - [`progressive`]: RemoteFX progressive bitstream encoder.
//! - [`avc`]: AVC420 surface-command composition.
//! - [`rtt`]: network-autodetect facade (RTT voting, bandwidth-measure
//!   bracketing).

use thiserror::Error;

pub mod avc;
pub mod dvc;
pub mod frame_controller;
pub mod gfx_surface;
pub mod pipeline;
pub mod progressive;
pub mod rtt;

pub use gfx_surface::{GfxSurface, GfxSurfaceFlags};
pub use pipeline::{GfxPduSink, GraphicsPipeline, PipelineEvent};

/// Grace period for the peer's CapsAdvertise after the channel opens
pub const PROTOCOL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Interval of the RTT-necessity downgrade check
pub const ENC_TIMES_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Bound on the tracked-frame queue; entries beyond it are discarded
/// oldest-first
pub const MAX_TRACKED_ENC_FRAMES: usize = 1000;

/// Minimum payload size worth bracketing with a bandwidth measurement
pub const MIN_BW_MEASURE_SIZE: usize = 10 * 1024;

/// Errors produced by the graphics pipeline
#[derive(Debug, Error)]
pub enum GfxError {
    /// The peer violated the protocol state machine
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// No mutually supported capability set (or an illegal re-advertise)
    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// Damage detection, encoding, or buffer import failed
    #[error("Graphics subsystem failure: {0}")]
    GraphicsSubsystemFailure(String),

    /// The channel is gone; no PDU can be delivered
    #[error("Graphics channel closed")]
    ChannelClosed,

    /// PDU encode/decode failed
    #[error("Wire format error: {0}")]
    Wire(String),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, GfxError>;
