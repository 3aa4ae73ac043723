//! Table storage as seen by the scheduler
//!
//! Couples a table's part registry with its block number allocator, its
//! mutations and the set of parts reserved by running tasks. Selection
//! reserves parts under the same lock it reads them with, so two workers
//! never pick overlapping sets.
//!
//! A replicated table also follows its [`TableLog`]: inserts and mutations
//! are appended there and take effect when the log is applied, on this
//! replica as on every other.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::parts::{
    referenced_columns, BlockAllocator, Datum, Part, PartError, PartInfo, PartRegistry,
    PartResult, DEFAULT_PARTITION,
};
use crate::sql::MutationCommand;

use super::mutation::MutationEntry;
use super::replicated::{EntryOutcome, TableLog, TableLogEntry};
use super::selector::{MergeCandidate, MergeSelector};
use super::transform::{JobKind, MergeJob};

#[derive(Default)]
struct TaskState {
    /// Parts claimed by queued or running tasks, with the number of claims
    reserved: HashMap<String, usize>,
    mutations_running: usize,
    mutations: BTreeMap<u64, MutationEntry>,
}

impl TaskState {
    fn pending_versions(&self) -> Vec<u64> {
        self.mutations
            .values()
            .filter(|m| !m.is_done)
            .map(|m| m.version)
            .collect()
    }
}

/// Number of pending mutations a part still needs; merges never mix values
fn pending_key(pending: &[u64], info: &PartInfo) -> usize {
    let version = info.data_version();
    pending.iter().filter(|&&v| version < v).count()
}

/// One table's parts plus its merge and mutation state
pub struct MergeTreeTable {
    registry: PartRegistry,
    blocks: BlockAllocator,
    columns: RwLock<Vec<String>>,
    tasks: Mutex<TaskState>,
    /// Bumped whenever mutation state changes
    mutations_tx: watch::Sender<u64>,
    replication: Option<TableLog>,
}

impl MergeTreeTable {
    pub fn new(registry: PartRegistry, blocks: BlockAllocator, columns: Vec<String>) -> Self {
        let (mutations_tx, _) = watch::channel(0);
        Self {
            registry,
            blocks,
            columns: RwLock::new(columns),
            tasks: Mutex::new(TaskState::default()),
            mutations_tx,
            replication: None,
        }
    }

    /// Follow `log` instead of changing parts directly
    #[must_use]
    pub fn with_replication(mut self, log: TableLog) -> Self {
        self.replication = Some(log);
        self
    }

    pub fn is_replicated(&self) -> bool {
        self.replication.is_some()
    }

    pub fn replication(&self) -> Option<&TableLog> {
        self.replication.as_ref()
    }

    pub fn database(&self) -> &str {
        self.registry.database()
    }

    pub fn name(&self) -> &str {
        self.registry.table()
    }

    pub fn registry(&self) -> &PartRegistry {
        &self.registry
    }

    pub fn columns(&self) -> Vec<String> {
        self.columns.read().clone()
    }

    /// Follow a schema change; existing parts keep the columns they were written with
    pub fn set_columns(&self, columns: Vec<String>) {
        *self.columns.write() = columns;
    }

    /// Write `rows` (in table column order) as a new part
    pub async fn insert(&self, rows: Vec<Vec<Datum>>) -> PartResult<String> {
        let block = self.blocks.allocate(DEFAULT_PARTITION).await?;
        let info = PartInfo::new_insert(DEFAULT_PARTITION, block);

        if let Some(log) = &self.replication {
            let name = info.name();
            let sequence_id = log
                .append(TableLogEntry::GetPart {
                    part_name: name.clone(),
                    columns: self.columns(),
                    rows,
                })
                .await?;
            return match log.wait_outcome(sequence_id).await? {
                EntryOutcome::Applied => Ok(name),
                EntryOutcome::Skipped(reason) | EntryOutcome::Failed(reason) => {
                    Err(PartError::Replication(reason))
                }
            };
        }

        let part = self.registry.build_part(info, self.columns(), rows);
        let name = part.name.clone();
        self.registry.add(part)?;
        tracing::debug!(database = %self.database(), table = %self.name(), part = %name, "Inserted part");
        Ok(name)
    }

    /// Add a part written on another replica, unless a live part already covers it
    pub(crate) fn fetch_part(
        &self,
        part_name: &str,
        columns: Vec<String>,
        rows: Vec<Vec<Datum>>,
    ) -> PartResult<EntryOutcome> {
        let info: PartInfo = part_name.parse()?;
        if let Some(covering) = self
            .registry
            .list_parts()
            .iter()
            .find(|p| p.info.contains(&info))
        {
            return Ok(EntryOutcome::Skipped(format!(
                "part {} is covered by {}",
                part_name, covering.name
            )));
        }
        self.registry
            .add(self.registry.build_part(info, columns, rows))?;
        tracing::debug!(database = %self.database(), table = %self.name(), part = %part_name, "Fetched part");
        Ok(EntryOutcome::Applied)
    }

    /// Register a mutation and return its version
    pub async fn add_mutation(&self, command: MutationCommand) -> PartResult<u64> {
        let columns = self.columns();
        let mut referenced = Vec::new();
        match &command {
            MutationCommand::Update {
                assignments,
                filter,
            } => {
                for (column, expr) in assignments {
                    referenced.push(column.as_str());
                    referenced_columns(expr, &mut referenced);
                }
                if let Some(filter) = filter {
                    referenced_columns(filter, &mut referenced);
                }
            }
            MutationCommand::Delete { filter } => referenced_columns(filter, &mut referenced),
        }
        if let Some(missing) = referenced.iter().find(|c| !columns.iter().any(|t| t == *c)) {
            return Err(PartError::ColumnNotFound(missing.to_string()));
        }

        let version = self.blocks.allocate(DEFAULT_PARTITION).await?;
        match &self.replication {
            Some(log) => {
                let sequence_id = log
                    .append(TableLogEntry::Mutation { version, command })
                    .await?;
                match log.wait_outcome(sequence_id).await? {
                    EntryOutcome::Applied => {}
                    EntryOutcome::Skipped(reason) | EntryOutcome::Failed(reason) => {
                        return Err(PartError::Replication(reason))
                    }
                }
            }
            None => self.register_mutation(version, command),
        }
        Ok(version)
    }

    /// Start tracking mutation `version`; a repeated registration is ignored
    pub(crate) fn register_mutation(&self, version: u64, command: MutationCommand) {
        {
            let mut tasks = self.tasks.lock();
            if tasks.mutations.contains_key(&version) {
                return;
            }
            tasks
                .mutations
                .insert(version, MutationEntry::new(version, command));
        }
        self.refresh_mutations();
        tracing::info!(database = %self.database(), table = %self.name(), version, "Registered mutation");
    }

    pub fn mutations(&self) -> Vec<MutationEntry> {
        self.tasks.lock().mutations.values().cloned().collect()
    }

    pub fn mutation(&self, version: u64) -> Option<MutationEntry> {
        self.tasks.lock().mutations.get(&version).cloned()
    }

    /// Receiver notified on every mutation state change
    pub fn subscribe_mutations(&self) -> watch::Receiver<u64> {
        self.mutations_tx.subscribe()
    }

    /// Recount parts per pending mutation and mark finished ones done
    pub fn refresh_mutations(&self) {
        let (parts, committed) = self.registry.snapshot();
        let mut tasks = self.tasks.lock();
        for entry in tasks.mutations.values_mut().filter(|m| !m.is_done) {
            entry.parts_to_do = parts
                .iter()
                .filter(|p| entry.applies_to(p.info.data_version()))
                .count();
            if entry.parts_to_do == 0 {
                entry.is_done = true;
                tracing::info!(
                    database = %self.registry.database(),
                    table = %self.registry.table(),
                    version = entry.version,
                    committed_version = committed,
                    "Mutation done"
                );
            }
        }
        drop(tasks);
        self.mutations_tx.send_modify(|v| *v += 1);
    }

    pub(crate) fn record_mutation_failure(&self, versions: &[u64], part: &str, reason: &str) {
        let mut tasks = self.tasks.lock();
        for version in versions {
            if let Some(entry) = tasks.mutations.get_mut(version) {
                entry.record_failure(part, reason);
            }
        }
        drop(tasks);
        self.mutations_tx.send_modify(|v| *v += 1);
    }

    /// Pick the next background task and reserve its parts
    pub(crate) fn select_job(
        self: &Arc<Self>,
        selector: &dyn MergeSelector,
    ) -> Option<(MergeJob, Reservation)> {
        let parts = self.registry.list_parts();
        let mut tasks = self.tasks.lock();
        let pending = tasks.pending_versions();

        if tasks.mutations_running == 0 && !pending.is_empty() {
            if let Some(job) = self.mutation_job(&tasks, &parts) {
                return Some(self.reserve(&mut tasks, job));
            }
        }

        let runs = Self::idle_runs(&tasks, &parts, &pending);
        let chosen = selector.select(&runs)?;
        let job = self.merge_job(&parts, &chosen)?;
        Some(self.reserve(&mut tasks, job))
    }

    /// All idle parts of the first partition that has at least two
    pub(crate) fn select_manual_merge(self: &Arc<Self>) -> Option<(MergeJob, Reservation)> {
        let parts = self.registry.list_parts();
        let mut tasks = self.tasks.lock();
        let pending = tasks.pending_versions();

        let runs = Self::idle_runs(&tasks, &parts, &pending);
        let chosen = runs.into_iter().find(|run| run.len() >= 2)?;
        let job = self.merge_job(&parts, &chosen)?;
        Some(self.reserve(&mut tasks, job))
    }

    fn mutation_job(&self, tasks: &TaskState, parts: &[Arc<Part>]) -> Option<MergeJob> {
        let part = parts.iter().find(|p| {
            !tasks.reserved.contains_key(&p.name)
                && tasks
                    .mutations
                    .values()
                    .any(|m| !m.is_done && m.applies_to(p.info.data_version()))
        })?;

        let mutations: Vec<(u64, MutationCommand)> = tasks
            .mutations
            .values()
            .filter(|m| !m.is_done && m.applies_to(part.info.data_version()))
            .map(|m| (m.version, m.command.clone()))
            .collect();
        let version = mutations.last().map(|(v, _)| *v)?;

        Some(MergeJob {
            kind: JobKind::Mutation { mutations },
            sources: vec![Arc::clone(part)],
            result: part.info.mutated(version),
            columns: self.columns(),
        })
    }

    fn merge_job(&self, parts: &[Arc<Part>], chosen: &[MergeCandidate]) -> Option<MergeJob> {
        let sources: Vec<Arc<Part>> = chosen
            .iter()
            .filter_map(|c| parts.iter().find(|p| p.name == c.name).cloned())
            .collect();
        if sources.len() < 2 || sources.len() != chosen.len() {
            return None;
        }
        let infos: Vec<PartInfo> = sources.iter().map(|p| p.info.clone()).collect();
        Some(MergeJob {
            kind: JobKind::Merge,
            result: PartInfo::merged(&infos)?,
            sources,
            columns: self.columns(),
        })
    }

    /// Runs of contiguous idle parts sharing partition and pending mutations
    fn idle_runs(
        tasks: &TaskState,
        parts: &[Arc<Part>],
        pending: &[u64],
    ) -> Vec<Vec<MergeCandidate>> {
        let mut runs: Vec<Vec<MergeCandidate>> = Vec::new();
        let mut current: Vec<MergeCandidate> = Vec::new();
        let mut current_key: Option<(String, usize)> = None;

        for part in parts {
            if tasks.reserved.contains_key(&part.name) {
                if !current.is_empty() {
                    runs.push(std::mem::take(&mut current));
                }
                current_key = None;
                continue;
            }
            let key = (
                part.info.partition_id.clone(),
                pending_key(pending, &part.info),
            );
            if current_key.as_ref() != Some(&key) && !current.is_empty() {
                runs.push(std::mem::take(&mut current));
            }
            current_key = Some(key);
            current.push(MergeCandidate {
                info: part.info.clone(),
                name: part.name.clone(),
                rows: part.num_rows(),
            });
        }
        if !current.is_empty() {
            runs.push(current);
        }
        runs
    }

    /// Job and reservation for a merge or part mutation read from the log
    ///
    /// `Err` carries the reason the entry is skipped on this replica.
    pub(crate) fn logged_job(
        self: &Arc<Self>,
        entry: &TableLogEntry,
    ) -> Result<(MergeJob, Reservation), String> {
        let source = |name: &String| {
            self.registry
                .get(name)
                .ok_or_else(|| format!("source part {} is gone", name))
        };
        let result_info = |name: &str| -> Result<PartInfo, String> {
            if self.registry.get(name).is_some() {
                return Err(format!("part {} already exists", name));
            }
            name.parse::<PartInfo>().map_err(|e| e.to_string())
        };

        let job = match entry {
            TableLogEntry::MergeParts { sources, result } => MergeJob {
                kind: JobKind::Merge,
                sources: sources.iter().map(source).collect::<Result<_, _>>()?,
                result: result_info(result.as_str())?,
                columns: self.columns(),
            },
            TableLogEntry::MutatePart {
                source: name,
                result,
                versions,
            } => {
                let part = source(name)?;
                let tasks = self.tasks.lock();
                let mutations = versions
                    .iter()
                    .map(|v| {
                        tasks
                            .mutations
                            .get(v)
                            .map(|m| (*v, m.command.clone()))
                            .ok_or_else(|| format!("mutation {} is not registered", v))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                drop(tasks);
                MergeJob {
                    kind: JobKind::Mutation { mutations },
                    sources: vec![part],
                    result: result_info(result.as_str())?,
                    columns: self.columns(),
                }
            }
            other => return Err(format!("{} entry is not a part task", other.kind())),
        };

        let mut tasks = self.tasks.lock();
        Ok(self.reserve(&mut tasks, job))
    }

    fn reserve(self: &Arc<Self>, tasks: &mut TaskState, job: MergeJob) -> (MergeJob, Reservation) {
        let parts = job.source_names();
        for name in &parts {
            *tasks.reserved.entry(name.clone()).or_insert(0) += 1;
        }
        let mutation = job.is_mutation();
        if mutation {
            tasks.mutations_running += 1;
        }
        let reservation = Reservation {
            table: Arc::clone(self),
            parts,
            mutation,
        };
        (job, reservation)
    }

    fn release(&self, parts: &[String], mutation: bool) {
        let mut tasks = self.tasks.lock();
        for name in parts {
            if let Some(count) = tasks.reserved.get_mut(name) {
                *count -= 1;
                if *count == 0 {
                    tasks.reserved.remove(name);
                }
            }
        }
        if mutation {
            tasks.mutations_running = tasks.mutations_running.saturating_sub(1);
        }
    }

    /// Parts currently claimed by tasks
    pub fn reserved_parts(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().reserved.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Claim on a task's source parts, released on drop
pub struct Reservation {
    table: Arc<MergeTreeTable>,
    parts: Vec<String>,
    mutation: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.table.release(&self.parts, self.mutation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::selector::SimpleMergeSelector;
    use crate::sql::{Parser, Statement};

    fn table() -> Arc<MergeTreeTable> {
        Arc::new(MergeTreeTable::new(
            PartRegistry::new("default", "t", "/var/lib/clickhouse"),
            BlockAllocator::local(),
            vec!["x".to_string()],
        ))
    }

    fn command(sql: &str) -> MutationCommand {
        match Parser::parse_one(sql).unwrap() {
            Statement::Mutation { command, .. } => command,
            other => panic!("unexpected {:?}", other),
        }
    }

    async fn insert(table: &MergeTreeTable, value: i64) -> String {
        table.insert(vec![vec![Datum::Int(value)]]).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_names_parts_from_block_one() {
        let t = table();
        assert_eq!(insert(&t, 1).await, "all_1_1_0");
        assert_eq!(insert(&t, 2).await, "all_2_2_0");
    }

    #[tokio::test]
    async fn test_reservations_prevent_overlap() {
        let t = table();
        for v in 0..3 {
            insert(&t, v).await;
        }
        let selector = SimpleMergeSelector::new(2, 10);
        let (job, reservation) = t.select_job(&selector).unwrap();
        assert_eq!(job.result.name(), "all_1_3_1");
        assert_eq!(t.reserved_parts().len(), 3);

        assert!(t.select_job(&selector).is_none());
        assert!(t.select_manual_merge().is_none());

        drop(reservation);
        assert!(t.reserved_parts().is_empty());
        assert!(t.select_manual_merge().is_some());
    }

    #[tokio::test]
    async fn test_mutation_selection_and_completion() {
        let t = table();
        insert(&t, 1).await;
        let version = t
            .add_mutation(command("ALTER TABLE t UPDATE x = 5 WHERE 1"))
            .await
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(t.mutation(version).unwrap().parts_to_do, 1);

        // A part inserted after the mutation does not need it
        insert(&t, 2).await;
        t.refresh_mutations();
        assert_eq!(t.mutation(version).unwrap().parts_to_do, 1);

        let selector = SimpleMergeSelector::new(2, 10);
        let (job, reservation) = t.select_job(&selector).unwrap();
        assert!(job.is_mutation());
        assert_eq!(job.source_names(), vec!["all_1_1_0"]);
        assert_eq!(job.result.name(), "all_1_1_0_2");

        // One mutation task at a time, and no merge across the boundary
        assert!(t.select_job(&selector).is_none());

        let result = t.registry().build_part(
            job.result.clone(),
            job.columns.clone(),
            vec![vec![Datum::Int(5)]],
        );
        t.registry().replace(&job.source_names(), result).unwrap();
        assert_eq!(t.registry().mutation_version(), version);
        drop(reservation);
        t.refresh_mutations();
        let entry = t.mutation(version).unwrap();
        assert!(entry.is_done);
        assert_eq!(entry.parts_to_do, 0);
    }

    #[tokio::test]
    async fn test_mutation_rejects_unknown_columns() {
        let t = table();
        assert!(matches!(
            t.add_mutation(command("ALTER TABLE t UPDATE y = 1 WHERE 1")).await,
            Err(PartError::ColumnNotFound(_))
        ));
        assert!(matches!(
            t.add_mutation(command("ALTER TABLE t DELETE WHERE z = 1")).await,
            Err(PartError::ColumnNotFound(_))
        ));
        assert!(t.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_part_skips_covered_parts() {
        let t = table();
        let rows = || vec![vec![Datum::Int(1)]];
        assert_eq!(
            t.fetch_part("all_0_0_0", t.columns(), rows()).unwrap(),
            EntryOutcome::Applied
        );
        assert_eq!(
            t.fetch_part("all_1_1_0", t.columns(), rows()).unwrap(),
            EntryOutcome::Applied
        );
        let merged = t.registry().build_part("all_0_1_1".parse().unwrap(), t.columns(), rows());
        t.registry()
            .replace(&["all_0_0_0".to_string(), "all_1_1_0".to_string()], merged)
            .unwrap();

        assert!(matches!(
            t.fetch_part("all_1_1_0", t.columns(), rows()).unwrap(),
            EntryOutcome::Skipped(_)
        ));
        assert!(t.fetch_part("bogus", t.columns(), rows()).is_err());
        assert_eq!(part_names(&t), vec!["all_0_1_1"]);
    }

    fn part_names(t: &MergeTreeTable) -> Vec<String> {
        t.registry().list_parts().iter().map(|p| p.name.clone()).collect()
    }

    #[tokio::test]
    async fn test_logged_jobs_share_reservations() {
        let t = table();
        for v in 0..2 {
            insert(&t, v).await;
        }
        let merge = TableLogEntry::MergeParts {
            sources: vec!["all_1_1_0".to_string(), "all_2_2_0".to_string()],
            result: "all_1_2_1".to_string(),
        };

        // Selected here, then read back from the log: both hold the sources
        let (_, selected) = t.select_manual_merge().unwrap();
        let (job, applied) = t.logged_job(&merge).unwrap();
        assert_eq!(job.result.name(), "all_1_2_1");
        drop(selected);
        assert_eq!(t.reserved_parts(), vec!["all_1_1_0", "all_2_2_0"]);
        drop(applied);
        assert!(t.reserved_parts().is_empty());

        let result = t.registry().build_part(job.result.clone(), job.columns.clone(), Vec::new());
        t.registry().replace(&job.source_names(), result).unwrap();
        assert_eq!(
            t.logged_job(&merge).err().as_deref(),
            Some("source part all_1_1_0 is gone")
        );
    }

    #[tokio::test]
    async fn test_logged_mutation_needs_registered_version() {
        let t = table();
        insert(&t, 1).await;
        let mutate = TableLogEntry::MutatePart {
            source: "all_1_1_0".to_string(),
            result: "all_1_1_0_5".to_string(),
            versions: vec![5],
        };
        assert_eq!(
            t.logged_job(&mutate).err().as_deref(),
            Some("mutation 5 is not registered")
        );

        t.register_mutation(5, command("ALTER TABLE t DELETE WHERE x = 1"));
        t.register_mutation(5, command("ALTER TABLE t UPDATE x = 2 WHERE 1"));
        assert_eq!(t.mutations().len(), 1);
        let (job, _reservation) = t.logged_job(&mutate).unwrap();
        assert_eq!(job.mutation_versions(), vec![5]);
        assert!(matches!(
            &job.kind,
            JobKind::Mutation { mutations } if matches!(mutations[0].1, MutationCommand::Delete { .. })
        ));
    }

    #[tokio::test]
    async fn test_mutation_without_parts_is_done_immediately() {
        let t = table();
        let version = t
            .add_mutation(command("ALTER TABLE t DELETE WHERE x = 1"))
            .await
            .unwrap();
        assert!(t.mutation(version).unwrap().is_done);
    }
}
