//! Error types for the message-channel stack.
//!
//! Every asynchronous operation in this crate settles with a
//! [`ConduitError`] on failure. The type is `Clone` because a single outcome is
//! frequently shared between many waiters (memoized permission checks, a
//! readiness signal observed by every client handler).

use thiserror::Error;

/// Main error type for the message-channel stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConduitError {
    // Peer unavailability
    #[error("The message channel is disposed")]
    ChannelDisposed,

    #[error("The requester \"{name}\" is disposed")]
    RequesterDisposed { name: String },

    #[error("The client handler is disposed")]
    ClientHandlerDisposed,

    #[error("Deferred job was skipped: the job processor has been disposed")]
    JobSkipped,

    #[error("Server is not ready: {reason}")]
    ReadinessFailed { reason: String },

    // Remote failures are carried verbatim so they reach the original caller
    // unchanged through any number of correlator hops.
    #[error("{message}")]
    Remote { message: String },

    // Permission denial is an expected outcome, not a fault.
    #[error("Permission denied for client {origin}: {reason}")]
    PermissionDenied { origin: String, reason: String },

    // Input validation
    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    // I/O and persistence
    #[error("IO error: {message}")]
    Io { message: String },

    #[error("JSON error: {message}")]
    Json { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for message-channel operations.
pub type Result<T> = std::result::Result<T, ConduitError>;

impl From<std::io::Error> for ConduitError {
    fn from(err: std::io::Error) -> Self {
        ConduitError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ConduitError {
    fn from(err: serde_json::Error) -> Self {
        ConduitError::Json {
            message: err.to_string(),
        }
    }
}

impl ConduitError {
    /// Create a permission denial for the given client origin.
    pub fn permission_denied(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        ConduitError::PermissionDenied {
            origin: origin.into(),
            reason: reason.into(),
        }
    }

    /// Create a remote failure carrying the peer's error message verbatim.
    pub fn remote(message: impl Into<String>) -> Self {
        ConduitError::Remote {
            message: message.into(),
        }
    }

    /// Whether this error means the owning scope went away (as opposed to a
    /// failure reported by the peer or a policy decision).
    pub fn is_disposal(&self) -> bool {
        matches!(
            self,
            ConduitError::ChannelDisposed
                | ConduitError::RequesterDisposed { .. }
                | ConduitError::ClientHandlerDisposed
                | ConduitError::JobSkipped
        )
    }

    /// Whether this error is a permission denial.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ConduitError::PermissionDenied { .. })
    }
}
