//! Link error taxonomy

use thiserror::Error;

/// Terminal outcomes of a connection flow and writer failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// No bonded peer carries the requested name
    #[error("no bonded peer named '{name}'")]
    PeerNotFound { name: String },

    /// Connect permission was not granted
    #[error("connect permission not granted")]
    PermissionDenied,

    /// The local adapter is missing or cannot be queried
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// A transport operation failed (retryable while opening)
    #[error("transport error: {0}")]
    Transport(String),

    /// Every allowed attempt failed
    #[error("connection failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The flow was cancelled before reaching an outcome
    #[error("connection flow cancelled")]
    Cancelled,

    /// No link is currently open
    #[error("not connected")]
    NotConnected,
}
