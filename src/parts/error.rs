//! Part registry error types

use thiserror::Error;

use crate::coordination::CoordinationError;

/// Part and part registry errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PartError {
    /// Part name already present in the table
    #[error("Part '{0}' already exists")]
    PartExists(String),

    /// Part name not present in the table
    #[error("Part '{0}' not found")]
    PartNotFound(String),

    /// Name does not follow `partition_min_max_level[_mutation]`
    #[error("Invalid part name: {0}")]
    InvalidName(String),

    /// Column not present in the part
    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    /// Expression could not be evaluated
    #[error("Evaluation error: {0}")]
    Eval(String),

    /// Block number allocation or table log access failed
    #[error("Coordination failed: {0}")]
    Coordination(#[from] CoordinationError),

    /// Replicated table log entry could not be applied
    #[error("Replication error: {0}")]
    Replication(String),
}

/// Result type for part operations
pub type PartResult<T> = Result<T, PartError>;
