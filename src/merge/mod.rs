//! Background merges and mutations
//!
//! The scheduler selects work per table, records it in the progress table
//! while it runs, and publishes results through the part registry. Parts of
//! replicated tables change only through their table log.

pub mod config;
pub mod error;
pub mod mutation;
pub mod progress;
pub mod replicated;
pub mod scheduler;
pub mod selector;
pub mod table;
pub mod transform;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use mutation::MutationEntry;
pub use progress::{
    format_array, ExecutionRecord, ProgressGuard, ProgressTable, DEFAULT_MERGES_COLUMNS,
    MERGES_COLUMNS,
};
pub use replicated::{EntryOutcome, LoggedEntry, TableLog, TableLogEntry};
pub use scheduler::{MergeScheduler, MergeSchedulerBuilder};
pub use selector::{MergeCandidate, MergeSelector, SimpleMergeSelector};
pub use table::{MergeTreeTable, Reservation};
pub use transform::{JobKind, MergeJob, NoopHook, PartTransformer, RowTransformer, TaskHook};
