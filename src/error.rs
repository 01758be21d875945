//! Error taxonomy for the conversation core.
//!
//! Network-facing failures are user-visible and carry a retry path; store
//! failures are logged and absorbed locally (availability over durability).
//! Missing thread/message ids are not errors — operations addressing them
//! return `false` / `None`.

/// Errors surfaced by the orchestrator and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The remote completion call exceeded its deadline. Recorded as a
    /// retryable `timeout` message.
    #[error("completion request timed out after {0}s")]
    TransportTimeout(u64),

    /// The remote completion call failed for another reason (server error,
    /// connection loss). Recorded like a timeout, with the text preserved.
    #[error("completion request failed: {0}")]
    Transport(String),

    /// Store I/O failure. Logged by the component that hit it; callers own
    /// any recovery policy.
    #[error("storage failure: {0}")]
    Persistence(#[from] anyhow::Error),
}
