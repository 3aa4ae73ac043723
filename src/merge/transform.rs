//! Part transformation seams
//!
//! [`PartTransformer`] produces the rows of a result part from its sources.
//! [`TaskHook`] runs after a task is registered in the progress table and
//! before the transformation starts; tests use it to hold a task open or to
//! make it fail.

use std::sync::Arc;

use async_trait::async_trait;

use crate::parts::{eval, matches, Datum, Part, PartError, PartInfo};
use crate::sql::MutationCommand;

use super::error::SchedulerResult;
use super::progress::ExecutionRecord;

/// What a task does to its sources
#[derive(Debug, Clone)]
pub enum JobKind {
    Merge,
    /// Pending mutations applied in version order
    Mutation { mutations: Vec<(u64, MutationCommand)> },
}

/// A selected unit of work
#[derive(Debug, Clone)]
pub struct MergeJob {
    pub kind: JobKind,
    /// Ascending block order
    pub sources: Vec<Arc<Part>>,
    pub result: PartInfo,
    /// Table columns the result is written with
    pub columns: Vec<String>,
}

impl MergeJob {
    pub fn is_mutation(&self) -> bool {
        matches!(self.kind, JobKind::Mutation { .. })
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|p| p.name.clone()).collect()
    }

    /// Mutation versions this job completes for its part
    pub fn mutation_versions(&self) -> Vec<u64> {
        match &self.kind {
            JobKind::Merge => Vec::new(),
            JobKind::Mutation { mutations } => mutations.iter().map(|(v, _)| *v).collect(),
        }
    }

    /// Progress record for this job
    pub fn record(&self, database: &str, table: &str, result_path: String) -> ExecutionRecord {
        ExecutionRecord {
            database: database.to_string(),
            table: table.to_string(),
            source_part_names: self.source_names(),
            source_part_paths: self.sources.iter().map(|p| p.path.clone()).collect(),
            result_part_name: self.result.name(),
            result_part_path: result_path,
            partition_id: self.result.partition_id.clone(),
            is_mutation: self.is_mutation(),
            started_at: std::time::Instant::now(),
        }
    }
}

/// Builds the rows of a result part
#[async_trait]
pub trait PartTransformer: Send + Sync {
    async fn transform(&self, job: &MergeJob) -> SchedulerResult<Vec<Vec<Datum>>>;
}

/// Called once the progress record is visible, before the transformation
#[async_trait]
pub trait TaskHook: Send + Sync {
    /// An `Err` fails the task with that reason
    async fn before_execute(&self, record: &ExecutionRecord) -> Result<(), String>;
}

/// Hook that does nothing
pub struct NoopHook;

#[async_trait]
impl TaskHook for NoopHook {
    async fn before_execute(&self, _record: &ExecutionRecord) -> Result<(), String> {
        Ok(())
    }
}

/// In-memory transformer: concatenates rows for merges and rewrites them
/// for mutations
pub struct RowTransformer;

impl RowTransformer {
    fn source_rows(job: &MergeJob) -> Vec<Vec<Datum>> {
        job.sources
            .iter()
            .flat_map(|part| {
                part.rows.iter().map(move |row| {
                    job.columns
                        .iter()
                        .map(|c| part.value(row, c))
                        .collect::<Vec<_>>()
                })
            })
            .collect()
    }

    fn apply(
        command: &MutationCommand,
        columns: &[String],
        rows: Vec<Vec<Datum>>,
    ) -> Result<Vec<Vec<Datum>>, PartError> {
        match command {
            MutationCommand::Delete { filter } => {
                let mut kept = Vec::with_capacity(rows.len());
                for row in rows {
                    if !matches(Some(filter), columns, &row)? {
                        kept.push(row);
                    }
                }
                Ok(kept)
            }
            MutationCommand::Update {
                assignments,
                filter,
            } => {
                let targets = assignments
                    .iter()
                    .map(|(column, expr)| {
                        columns
                            .iter()
                            .position(|c| c == column)
                            .map(|idx| (idx, expr))
                            .ok_or_else(|| PartError::ColumnNotFound(column.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                let mut updated = Vec::with_capacity(rows.len());
                for row in rows {
                    if !matches(filter.as_ref(), columns, &row)? {
                        updated.push(row);
                        continue;
                    }
                    // Assignments all see the original row
                    let mut new_row = row.clone();
                    for (idx, expr) in &targets {
                        new_row[*idx] = eval(expr, columns, &row)?;
                    }
                    updated.push(new_row);
                }
                Ok(updated)
            }
        }
    }
}

#[async_trait]
impl PartTransformer for RowTransformer {
    async fn transform(&self, job: &MergeJob) -> SchedulerResult<Vec<Vec<Datum>>> {
        let mut rows = Self::source_rows(job);
        if let JobKind::Mutation { mutations } = &job.kind {
            for (_, command) in mutations {
                rows = Self::apply(command, &job.columns, rows)?;
            }
        }
        Ok(rows)
    }
}
