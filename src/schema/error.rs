//! Schema error types

use thiserror::Error;

use crate::sql::SqlError;

/// Errors raised while applying a schema change
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// Statement text could not be parsed
    #[error("{0}")]
    Parse(#[from] SqlError),

    /// Table already exists
    #[error("Table '{0}' already exists")]
    TableExists(String),

    /// Table not found
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    /// Column already exists
    #[error("Column '{column}' already exists in table '{table}'")]
    ColumnExists { table: String, column: String },

    /// Column not found
    #[error("Column '{column}' not found in table '{table}'")]
    ColumnNotFound { table: String, column: String },

    /// Statement names a table of another database
    #[error("Statement targets database '{found}' but was applied to '{expected}'")]
    ForeignDatabase { expected: String, found: String },

    /// Column definition is not valid
    #[error("Invalid column definition: {0}")]
    InvalidColumn(String),
}

/// Result type for schema operations
pub type SchemaResult<T> = Result<T, SchemaError>;
