//! Merge scheduler configuration

use std::time::Duration;

/// Default number of worker tasks
pub const DEFAULT_WORKERS: usize = 2;

/// Default run length that triggers a background merge
pub const DEFAULT_MIN_PARTS_TO_MERGE: usize = 6;

/// Default upper bound on parts in one merge
pub const DEFAULT_MAX_PARTS_TO_MERGE: usize = 100;

/// Default interval between selection passes when nothing signals new work
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Default root reported in part paths
pub const DEFAULT_DATA_ROOT: &str = "/var/lib/clickhouse";

/// Configuration for the merge scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker tasks executing merges and mutations
    pub workers: usize,

    /// Contiguous idle parts needed before a background merge starts
    pub min_parts_to_merge: usize,

    /// Most parts combined by one merge
    pub max_parts_to_merge: usize,

    /// Periodic selection interval
    pub check_interval: Duration,

    /// Root of `<root>/data/<database>/<table>/<part>/`
    pub data_root: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            min_parts_to_merge: DEFAULT_MIN_PARTS_TO_MERGE,
            max_parts_to_merge: DEFAULT_MAX_PARTS_TO_MERGE,
            check_interval: DEFAULT_CHECK_INTERVAL,
            data_root: DEFAULT_DATA_ROOT.to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers (at least one)
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the background merge trigger and bound
    #[must_use]
    pub fn with_parts_to_merge(mut self, min: usize, max: usize) -> Self {
        self.min_parts_to_merge = min.max(2);
        self.max_parts_to_merge = max.max(self.min_parts_to_merge);
        self
    }

    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    #[must_use]
    pub fn with_data_root(mut self, root: impl Into<String>) -> Self {
        self.data_root = root.into();
        self
    }
}
