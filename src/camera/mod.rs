//! Camera redirection (MS-RDPECAM), server side
//!
//! Decodes H.264 samples streamed FROM the client's webcams and
//! republishes them as local PipeWire video sources:
//!
//! ```text
//!            DVC "RDCamera_Device_Enumerator"
//! client ◄──────────────────────────────────► CameraEnumerator
//!            per-device DVC (peer-named)           │ announces
//! client ◄──────────────────────────────────► CameraDevice (own thread,
//!                                              │   own PipeWire core)
//!                              SampleRequest ◄─┤
//!                             SampleResponse ──┤► decode (AVC420 software)
//!                                              ▼
//!                                    PipeWire video source (BGRA)
//! ```
//!
//! The enumerator negotiates the protocol version and turns device
//! added/removed notifications into pending operations applied on the
//! session main loop. Each device runs its initialization state machine
//! on a dedicated thread, keeps a single client request in flight, and
//! queues restarts for its still-running streams when any stream must be
//! reconfigured (the protocol can only stop all streams at once).

use thiserror::Error;

pub mod decode;
pub mod device;
pub mod dvc;
pub mod enumerator;
pub mod pdu;
pub mod sample;
pub mod source;
pub mod stream;

pub use device::CameraDevice;
pub use enumerator::CameraEnumerator;

/// Server protocol version
pub const SERVER_VERSION: u8 = 2;

/// Maximum DVC name length in bytes
pub const MAX_DVC_NAME_LEN: usize = 256;

/// Samples without any response are flushed as corrupted after this
pub const SAMPLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Errors produced by the camera subsystem
#[derive(Debug, Error)]
pub enum CameraError {
    /// The peer violated the protocol state machine
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// PDU encode/decode failed
    #[error("Wire format error: {0}")]
    Wire(String),

    /// The peer reported an error for a request
    #[error("Peer error: {0}")]
    PeerError(String),

    /// Decoding a sample failed
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// PipeWire operation failed
    #[error("PipeWire failure: {0}")]
    PipeWire(String),

    /// The device entered a fatal state and must be removed
    #[error("Device failed: {0}")]
    DeviceFailed(String),
}

/// Result type for camera operations
pub type Result<T> = std::result::Result<T, CameraError>;
