//! Merge scheduler error types

use thiserror::Error;

use crate::parts::PartError;

/// Merge and mutation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// Transformation or publish failed; sources are untouched
    #[error("Execution of {result_part} in {database}.{table} failed: {reason}")]
    ExecutionFailure {
        database: String,
        table: String,
        result_part: String,
        reason: String,
    },

    /// A task producing the same result part is already running
    #[error("Part {0} is already being produced")]
    SelectionConflict(String),

    /// Table not attached to the scheduler
    #[error("Table {database}.{table} is not managed by the merge scheduler")]
    TableNotFound { database: String, table: String },

    /// Mutation version unknown for the table
    #[error("Mutation {version} not found in {database}.{table}")]
    MutationNotFound {
        database: String,
        table: String,
        version: u64,
    },

    /// Part level failure (block allocation, evaluation, registry)
    #[error(transparent)]
    Part(#[from] PartError),

    /// Scheduler stopped
    #[error("Merge scheduler is shut down")]
    Shutdown,
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;
