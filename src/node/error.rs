//! Node error types

use thiserror::Error;

use crate::coordination::CoordinationError;
use crate::merge::SchedulerError;
use crate::parts::PartError;
use crate::replication::ReplicationError;
use crate::schema::SchemaError;
use crate::sql::SqlError;

/// Errors returned by [`Node::query`](super::Node::query)
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Part(#[from] PartError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error("Database {0} already exists")]
    DatabaseExists(String),

    #[error("Database {0} does not exist")]
    DatabaseNotFound(String),

    #[error("Table {0} does not exist")]
    TableNotFound(String),

    #[error("Unknown macro {{{0}}}")]
    UnknownMacro(String),

    #[error("Invalid database engine: {0}")]
    InvalidEngine(String),

    #[error("Insert error: {0}")]
    Insert(String),
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;
