//! Session support
//!
//! Pieces the protocol session hangs onto: transmission metrics, the SAM
//! exchange file for NTLM authentication, and the authorization prompt
//! interface.

pub mod metrics;
pub mod prompt;
pub mod sam;

pub use metrics::SessionMetrics;
pub use prompt::{Prompt, PromptBackend, PromptCancellable, PromptDefinition, PromptError, PromptResponse};
pub use sam::SamFile;
