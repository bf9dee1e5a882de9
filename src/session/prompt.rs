//! Authorization prompts
//!
//! A prompt asks the local user to accept or reject an incoming session.
//! The transport to an actual dialog (notification daemon, portal) is an
//! external collaborator; this module defines the request shape and a
//! cancellable in-flight query.

use std::sync::Arc;

use thiserror::Error;
use cancellation::CancellationFlag;
use tokio::sync::oneshot;

/// Errors produced by prompt queries
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    /// The query was cancelled before the user answered
    #[error("Prompt query cancelled")]
    Cancelled,

    /// The prompt backend went away
    #[error("Prompt backend closed")]
    BackendClosed,
}

/// A user-visible authorization request
///
/// Any field may be absent; backends render what they get.
#[derive(Debug, Clone, Default)]
pub struct PromptDefinition {
    /// Short one-line summary
    pub summary: Option<String>,
    /// Longer body text
    pub body: Option<String>,
    /// Label of the accepting action
    pub accept_label: Option<String>,
    /// Label of the cancelling action
    pub cancel_label: Option<String>,
}

/// The user's answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptResponse {
    /// The accepting action was chosen
    Accept,
    /// The cancelling action was chosen (or the dialog dismissed)
    Cancel,
}

mod cancellation {
    //! Small cancellation token: a flag plus a notifier.

    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    pub(super) struct CancellationFlag {
        cancelled: AtomicBool,
        notify: Notify,
    }

    impl CancellationFlag {
        pub(super) fn cancel(&self) {
            self.cancelled.store(true, Ordering::Release);
            self.notify.notify_waiters();
        }

        pub(super) fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::Acquire)
        }

        pub(super) async fn cancelled(&self) {
            if self.is_cancelled() {
                return;
            }
            loop {
                let notified = self.notify.notified();
                if self.is_cancelled() {
                    return;
                }
                notified.await;
                if self.is_cancelled() {
                    return;
                }
            }
        }
    }
}

/// Cancellation handle for an in-flight query
#[derive(Clone, Default)]
pub struct PromptCancellable {
    flag: Arc<CancellationFlag>,
}

impl PromptCancellable {
    /// Create an uncancelled handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the query; the waiter receives [`PromptError::Cancelled`]
    pub fn cancel(&self) {
        self.flag.cancel();
    }
}

/// Backend delivering prompts to the user
pub trait PromptBackend: Send + Sync {
    /// Present `definition` and return a receiver for the response
    ///
    /// Closing the dialog counts as [`PromptResponse::Cancel`].
    fn present(&self, definition: PromptDefinition) -> oneshot::Receiver<PromptResponse>;

    /// Withdraw a presented prompt (query cancelled)
    fn close(&self);
}

/// Cancellable prompt query front-end
pub struct Prompt {
    backend: Arc<dyn PromptBackend>,
}

impl Prompt {
    /// Create a prompt front-end over `backend`
    pub fn new(backend: Arc<dyn PromptBackend>) -> Self {
        Self { backend }
    }

    /// Ask the user and wait for the answer
    ///
    /// Cancellation closes the notification and delivers
    /// [`PromptError::Cancelled`] to the caller.
    pub async fn query(
        &self,
        definition: PromptDefinition,
        cancellable: &PromptCancellable,
    ) -> Result<PromptResponse, PromptError> {
        let receiver = self.backend.present(definition);

        tokio::select! {
            response = receiver => response.map_err(|_| PromptError::BackendClosed),
            _ = cancellable.flag.cancelled() => {
                self.backend.close();
                Err(PromptError::Cancelled)
            }
        }
    }
}
