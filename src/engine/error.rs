//! Error types for container engine calls.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors reported by a container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not be reached at all.
    #[error("container engine not available: {reason}")]
    Unavailable {
        /// Reason the engine is unreachable.
        reason: String,
    },

    /// A referenced resource does not exist in the engine.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Resource kind (container, image, network).
        kind: &'static str,
        /// Identity or name that was looked up.
        name: String,
    },

    /// A resource with the same name already exists.
    #[error("{kind} '{name}' already exists")]
    Conflict {
        /// Resource kind.
        kind: &'static str,
        /// Conflicting name.
        name: String,
    },

    /// The engine rejected or failed a request.
    #[error("{operation} failed: {reason}")]
    Request {
        /// Engine operation that failed (e.g. "create container").
        operation: &'static str,
        /// Reason reported by the engine.
        reason: String,
    },

    /// A progress or log stream reported an error mid-flight.
    #[error("{operation} stream error: {reason}")]
    Stream {
        /// Engine operation producing the stream.
        operation: &'static str,
        /// Error message from the stream.
        reason: String,
    },
}

impl EngineError {
    pub(crate) fn request(operation: &'static str, reason: impl ToString) -> Self {
        Self::Request {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Whether this error means the resource is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
