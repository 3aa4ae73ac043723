//! coldb - replicated schema and background merges for a column store
//!
//! Features:
//! - Replicated DDL log in an external coordination store, applied in order by every replica
//! - Part registry with atomic replacement of merged and mutated parts
//! - Background merge/mutation scheduler with a live `system.merges` view
//! - Node query surface tying databases, tables and the scheduler together

pub mod coordination;
pub mod merge;
pub mod node;
pub mod parts;
pub mod replication;
pub mod schema;
pub mod sql;
