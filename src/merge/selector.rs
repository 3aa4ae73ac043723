//! Merge selection
//!
//! The scheduler hands the selector runs of contiguous idle parts (same
//! partition, ascending blocks, no busy part in between, same pending
//! mutations). The selector picks at most one set to merge.

use crate::parts::PartInfo;

use super::config::SchedulerConfig;

/// Part offered to a selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCandidate {
    pub info: PartInfo,
    pub name: String,
    pub rows: usize,
}

/// Chooses which parts to merge next
pub trait MergeSelector: Send + Sync {
    /// Pick a contiguous slice of one run, or nothing
    fn select(&self, runs: &[Vec<MergeCandidate>]) -> Option<Vec<MergeCandidate>>;
}

/// Merges once a run reaches `min_parts`, preferring the smallest total size
#[derive(Debug, Clone)]
pub struct SimpleMergeSelector {
    min_parts: usize,
    max_parts: usize,
}

impl SimpleMergeSelector {
    pub fn new(min_parts: usize, max_parts: usize) -> Self {
        let min_parts = min_parts.max(2);
        Self {
            min_parts,
            max_parts: max_parts.max(min_parts),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.min_parts_to_merge, config.max_parts_to_merge)
    }
}

impl MergeSelector for SimpleMergeSelector {
    fn select(&self, runs: &[Vec<MergeCandidate>]) -> Option<Vec<MergeCandidate>> {
        let mut best: Option<(usize, &[MergeCandidate])> = None;

        for run in runs.iter().filter(|run| run.len() >= self.min_parts) {
            let width = run.len().min(self.max_parts);
            for window in run.windows(width) {
                let total: usize = window.iter().map(|c| c.rows).sum();
                if best.map_or(true, |(best_total, _)| total < best_total) {
                    best = Some((total, window));
                }
            }
        }

        best.map(|(_, window)| window.to_vec())
    }
}
