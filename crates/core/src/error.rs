//! Queue error model.

use thiserror::Error;

/// Errors surfaced by a stream store implementation.
///
/// Keep this focused on the transport: connectivity, command rejection,
/// reply-shape surprises. Per-message failures (handler errors, malformed
/// payloads) are handled by the processing layer and never appear here.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is unreachable (transient; callers back off and retry).
    #[error("connection error: {0}")]
    Connection(String),

    /// The store rejected a command (e.g. an explicit entry id at or below
    /// the stream's current maximum).
    #[error("command error: {0}")]
    Command(String),

    /// The store replied with a shape we do not understand.
    #[error("unexpected reply: {0}")]
    BadReply(String),
}

/// Errors surfaced to producers.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
