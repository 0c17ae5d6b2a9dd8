//! Common error types for FieldSync.

use thiserror::Error;

/// Top-level error type for FieldSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Connectivity failure before a response was received.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote API answered with an error status.
    #[error("API error ({status:?}): {message}")]
    Api {
        status: Option<u16>,
        message: String,
        body: Option<String>,
    },

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

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Work was cancelled cooperatively.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// HTTP status carried by an API error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => *status,
            _ => None,
        }
    }

    /// Response body carried by an API error, cut to `max` characters.
    pub fn response_body(&self, max: usize) -> Option<String> {
        match self {
            Error::Api { body: Some(body), .. } => Some(body.chars().take(max).collect()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
