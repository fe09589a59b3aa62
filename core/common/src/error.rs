//! Common error types for lexisync.

use thiserror::Error;

/// Top-level error type for lexisync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable store read or write failed.
    #[error("Storage error: {0}")]
    Storage(String),

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

    /// Transport-level failure (connection refused, 5xx, ...).
    #[error("Network error: {0}")]
    Network(String),

    /// A network call exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote answered with a non-retryable error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Missing or rejected credentials.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A payload failed its domain schema.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The operation was cancelled before it completed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Sync engine failure (worker gone, channel closed).
    #[error("Sync error: {0}")]
    Sync(String),
}

impl Error {
    /// Whether the error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
    }

    /// Whether the error stems from bad data rather than the environment.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
