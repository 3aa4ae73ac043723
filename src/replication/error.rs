//! Replication error types

use thiserror::Error;

use crate::coordination::{CoordinationError, Retryable};
use crate::schema::SchemaError;
use crate::sql::SqlError;

/// DDL log and replicator errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicationError {
    /// Store unreachable; the caller may retry with backoff
    #[error("Coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    /// Any other store failure
    #[error("Coordination error: {0}")]
    Coordination(CoordinationError),

    /// Replica is still replaying the log
    #[error("Replica of database '{database}' is not active yet")]
    NotYetActive { database: String },

    /// A log entry could not be applied; the replica is in error state
    #[error("Failed to apply entry {sequence_id} to database '{database}': {reason}")]
    ApplyFailure {
        database: String,
        sequence_id: u64,
        reason: String,
    },

    /// Statement does not apply to the current schema and was not logged
    #[error("{0}")]
    Rejected(#[from] SchemaError),

    /// Statement text is not valid DDL
    #[error("{0}")]
    Parse(#[from] SqlError),

    /// Log entry payload could not be decoded
    #[error("Corrupt log entry {path}: {reason}")]
    CorruptEntry { path: String, reason: String },

    /// Replica state could not be saved or loaded
    #[error("Replica state error: {0}")]
    Persist(String),

    /// Replicator stopped
    #[error("Replicator is shut down")]
    Shutdown,
}

impl From<CoordinationError> for ReplicationError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::Unavailable(msg) => ReplicationError::CoordinationUnavailable(msg),
            other => ReplicationError::Coordination(other),
        }
    }
}

impl Retryable for ReplicationError {
    fn is_transient(&self) -> bool {
        matches!(self, ReplicationError::CoordinationUnavailable(_))
    }
}

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;
