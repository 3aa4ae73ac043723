//! Schema state
//!
//! Column descriptions, table definitions, and the per-database schema that
//! DDL log entries are folded into. Everything here is plain data: the same
//! ordered entries always produce the same schema.

pub mod columns;
pub mod database;
pub mod error;
pub mod table;

pub use columns::{ColumnDescription, ColumnsDescription};
pub use database::{rows_to_tsv, DatabaseSchema, SchemaChange};
pub use error::{SchemaError, SchemaResult};
pub use table::{EngineKind, TableDef};
