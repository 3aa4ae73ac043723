//! Coordination store error types

use thiserror::Error;

/// Coordination store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// Store unreachable (transient, retry with backoff)
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    /// Non-sequential create on an existing path
    #[error("Path already exists: {0}")]
    PathExists(String),

    /// Path (or its parent) does not exist
    #[error("No node: {0}")]
    NoNode(String),

    /// Compare-and-swap version mismatch
    #[error("Bad version for {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    /// Malformed path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoordinationError {
    /// Whether the operation may succeed if retried later
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinationError::Unavailable(_))
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(e: serde_json::Error) -> Self {
        CoordinationError::Serialization(e.to_string())
    }
}

/// Result type for coordination store operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;
