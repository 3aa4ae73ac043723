//! Replicated DDL
//!
//! - `log`: the append-only, globally ordered DDL log in the coordination store
//! - `state`: the persisted replica position and schema snapshot
//! - `replicator`: the per-replica task that applies the log in order

pub mod error;
pub mod log;
pub mod replicator;
pub mod state;

pub use error::{ReplicationError, ReplicationResult};
pub use log::{DdlLog, DdlLogEntry, LogCursor};
pub use replicator::{DdlReplicator, ReplicaProgress, ReplicatorConfig};
pub use state::{ReplicaState, ReplicaStatus, StateFile};
