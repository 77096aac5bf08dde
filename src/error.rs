//! Error types for the broker proxy.

/// Errors that can occur while proxying between workers and upstream brokers.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The authorization endpoint rejected the client-credentials exchange.
    #[error("OAuth exchange failed: {reason}")]
    OAuth { reason: String },

    /// Upstream session create failed with a non-conflict status.
    #[error("Session create failed: {reason}")]
    Session { reason: String },

    /// Upstream reported an existing session for this target (HTTP 409).
    #[error("Session conflict for target {target_id}")]
    SessionConflict { target_id: String },

    /// Transport failure while long-polling for messages.
    #[error("Message poll failed: {reason}")]
    Poll { reason: String },

    /// Upstream acquirejob returned a non-success status.
    #[error("Job acquire failed: {reason}")]
    Acquire { reason: String },

    /// Failure while forwarding a worker request to upstream.
    #[error("Forward to upstream failed: {reason}")]
    Forward { reason: String },

    /// An upstream message body could not be parsed.
    #[error("Unreadable upstream message: {reason}")]
    Parse { reason: String },

    /// Credential artifacts on disk are missing or malformed.
    #[error("Credential error: {reason}")]
    Credential { reason: String },

    /// The local server could not be started or stopped.
    #[error("Server error: {reason}")]
    Server { reason: String },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
