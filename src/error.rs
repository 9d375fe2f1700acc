//! Error types for the query cache
//!
//! Two families live here: [`FetchError`], the failure value a fetch function
//! reports back to the cache (and which the retry classifier inspects), and
//! [`CacheError`], the error type of the cache's own operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a fetch function
///
/// The transport decides how much it knows about a failure. A typed variant,
/// an HTTP status, or a bare message are all accepted; the retry classifier
/// derives the failure category from whichever signal is present.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchError {
    /// Credentials missing or rejected (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not permitted (403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Request rejected as malformed (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request rejected by validation (422)
    #[error("Unprocessable request: {0}")]
    Unprocessable(String),

    /// Any other HTTP failure status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Network-level failure before a response arrived
    #[error("Network error: {0}")]
    Network(String),

    /// The request did not complete in time
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The payload could not be encoded into or decoded from the cache
    #[error("Decode error: {0}")]
    Decode(String),

    /// Unstructured failure, classified by its message
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Build a failure from an HTTP status code, picking the typed variant
    /// for the statuses the classifier cares about
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => FetchError::Unauthorized(message),
            403 => FetchError::Forbidden(message),
            400 => FetchError::BadRequest(message),
            422 => FetchError::Unprocessable(message),
            _ => FetchError::Http { status, message },
        }
    }

    /// HTTP status carried by this failure, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Unauthorized(_) => Some(401),
            FetchError::Forbidden(_) => Some(403),
            FetchError::BadRequest(_) => Some(400),
            FetchError::Unprocessable(_) => Some(422),
            FetchError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<String> for FetchError {
    fn from(s: String) -> Self {
        FetchError::Other(s)
    }
}

impl From<&str> for FetchError {
    fn from(s: &str) -> Self {
        FetchError::Other(s.to_string())
    }
}

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// No entry (or no registered fetch function) exists for the key
    #[error("Unknown cache key: {0}")]
    UnknownKey(String),

    /// The entry was removed while a subscriber was still waiting on it
    #[error("Cache entry removed: {0}")]
    EntryRemoved(String),

    /// Terminal fetch failure surfaced to the caller
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}
