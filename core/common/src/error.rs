//! Common error types for the LimeAura offline modules.

use thiserror::Error;

/// Top-level error type for offline store and sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local persistence cannot be read or written (quota exceeded,
    /// database unavailable, storage not supported).
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Network failure, timeout or a non-409 HTTP status.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote reported a version conflict (HTTP 409).
    #[error("Remote conflict: {0}")]
    RemoteConflict(String),

    /// The sync scheduler is not running.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error is a remote conflict that needs explicit resolution.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::RemoteConflict(_))
    }

    /// Whether the local store rejected the operation.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
