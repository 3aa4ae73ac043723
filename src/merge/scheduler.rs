//! Merge and mutation scheduler
//!
//! Worker tasks pull from an explicit queue. Manual merges (`OPTIMIZE`) are
//! queued with a reply channel; when the queue is empty a worker runs a
//! selection pass over the attached tables. Each task runs in three phases:
//! register the progress record, transform outside any lock, then publish
//! with an atomic registry replace. The record and the part reservation are
//! dropped on every path.
//!
//! Replicated tables never run a selected task directly. The worker appends
//! it to the table log and waits; a per-table puller applies the log in
//! order on every replica, running merges and mutations through the same
//! three phases.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::sql::MutationCommand;

use super::config::SchedulerConfig;
use super::error::{SchedulerError, SchedulerResult};
use super::mutation::MutationEntry;
use super::progress::ProgressTable;
use super::replicated::{EntryOutcome, LoggedEntry, TableLog, TableLogEntry};
use super::selector::{MergeSelector, SimpleMergeSelector};
use super::table::{MergeTreeTable, Reservation};
use super::transform::{MergeJob, NoopHook, PartTransformer, RowTransformer, TaskHook};

type TableKey = (String, String);

struct QueuedTask {
    table: Arc<MergeTreeTable>,
    job: MergeJob,
    reservation: Reservation,
    reply: Option<oneshot::Sender<SchedulerResult<String>>>,
}

struct Shared {
    config: SchedulerConfig,
    progress: Arc<ProgressTable>,
    selector: Arc<dyn MergeSelector>,
    transformer: Arc<dyn PartTransformer>,
    hook: Arc<dyn TaskHook>,
    tables: RwLock<BTreeMap<TableKey, Arc<MergeTreeTable>>>,
    queue: Mutex<VecDeque<QueuedTask>>,
    /// Signals queued tasks or new parts
    work: Notify,
    /// Rotates the table a selection pass starts from
    next_table: AtomicUsize,
    shutdown: AtomicBool,
}

/// Builder for [`MergeScheduler`]
pub struct MergeSchedulerBuilder {
    config: SchedulerConfig,
    progress: Arc<ProgressTable>,
    selector: Option<Arc<dyn MergeSelector>>,
    transformer: Arc<dyn PartTransformer>,
    hook: Arc<dyn TaskHook>,
}

impl MergeSchedulerBuilder {
    #[must_use]
    pub fn progress(mut self, progress: Arc<ProgressTable>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn selector(mut self, selector: Arc<dyn MergeSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    #[must_use]
    pub fn transformer(mut self, transformer: Arc<dyn PartTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn TaskHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Spawn the workers
    pub fn start(self) -> MergeScheduler {
        let selector = self
            .selector
            .unwrap_or_else(|| Arc::new(SimpleMergeSelector::from_config(&self.config)));
        let workers = self.config.workers.max(1);
        let shared = Arc::new(Shared {
            config: self.config,
            progress: self.progress,
            selector,
            transformer: self.transformer,
            hook: self.hook,
            tables: RwLock::new(BTreeMap::new()),
            queue: Mutex::new(VecDeque::new()),
            work: Notify::new(),
            next_table: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let (shutdown_tx, _) = watch::channel(false);
        let handles = (0..workers)
            .map(|id| {
                let shared = Arc::clone(&shared);
                let shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(worker(shared, id, shutdown_rx))
            })
            .collect();
        tracing::info!(workers, "Merge scheduler started");

        MergeScheduler {
            shared,
            shutdown_tx,
            workers: Mutex::new(handles),
            pullers: Mutex::new(BTreeMap::new()),
        }
    }
}

/// Background merge and mutation executor for one node
pub struct MergeScheduler {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Log followers of replicated tables
    pullers: Mutex<BTreeMap<TableKey, JoinHandle<()>>>,
}

impl MergeScheduler {
    /// Start building a scheduler with the default selector, transformer and hook
    pub fn builder(config: SchedulerConfig) -> MergeSchedulerBuilder {
        MergeSchedulerBuilder {
            config,
            progress: Arc::new(ProgressTable::new()),
            selector: None,
            transformer: Arc::new(RowTransformer),
            hook: Arc::new(NoopHook),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn progress(&self) -> &Arc<ProgressTable> {
        &self.shared.progress
    }

    /// Manage a table, following its log if it is replicated
    pub fn attach(&self, table: Arc<MergeTreeTable>) {
        let key = (table.database().to_string(), table.name().to_string());
        if table.is_replicated() {
            let handle = tokio::spawn(puller(
                Arc::clone(&self.shared),
                Arc::clone(&table),
                self.shutdown_tx.subscribe(),
            ));
            if let Some(previous) = self.pullers.lock().insert(key.clone(), handle) {
                previous.abort();
            }
        }
        if let Some(previous) = self.shared.tables.write().insert(key, table) {
            if let Some(log) = previous.replication() {
                log.stop();
            }
        }
        self.notify();
    }

    /// Stop managing a table; running tasks finish against the detached storage
    pub fn detach(&self, database: &str, table: &str) -> Option<Arc<MergeTreeTable>> {
        let key = (database.to_string(), table.to_string());
        let removed = self.shared.tables.write().remove(&key);
        if let Some(log) = removed.as_ref().and_then(|t| t.replication()) {
            log.stop();
        }
        if let Some(handle) = self.pullers.lock().remove(&key) {
            handle.abort();
        }
        removed
    }

    pub fn table(&self, database: &str, table: &str) -> SchedulerResult<Arc<MergeTreeTable>> {
        self.shared.table(database, table)
    }

    /// Wake a worker for a selection pass
    pub fn notify(&self) {
        self.shared.work.notify_one();
    }

    /// Merge all idle parts of a partition and wait for the outcome
    ///
    /// Returns the result part name, or `None` when there is nothing to merge.
    pub async fn optimize(&self, database: &str, table: &str) -> SchedulerResult<Option<String>> {
        let table = self.shared.table(database, table)?;
        let Some((job, reservation)) = table.select_manual_merge() else {
            return Ok(None);
        };

        if let Some(log) = table.replication() {
            let outcome = self.shared.publish(log, &job).await;
            drop(reservation);
            return match outcome? {
                EntryOutcome::Applied => Ok(Some(job.result.name())),
                EntryOutcome::Skipped(reason) => {
                    tracing::debug!(database, table = %table.name(), reason = %reason, "Manual merge skipped");
                    Ok(None)
                }
                EntryOutcome::Failed(reason) => Err(SchedulerError::ExecutionFailure {
                    database: database.to_string(),
                    table: table.name().to_string(),
                    result_part: job.result.name(),
                    reason,
                }),
            };
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.shared.queue.lock();
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Err(SchedulerError::Shutdown);
            }
            queue.push_back(QueuedTask {
                table,
                job,
                reservation,
                reply: Some(tx),
            });
        }
        self.shared.work.notify_one();

        rx.await.map_err(|_| SchedulerError::Shutdown)?.map(Some)
    }

    /// Register a mutation and return its version
    pub async fn mutate(
        &self,
        database: &str,
        table: &str,
        command: MutationCommand,
    ) -> SchedulerResult<u64> {
        let table = self.shared.table(database, table)?;
        let version = table.add_mutation(command).await?;
        self.notify();
        Ok(version)
    }

    /// Wait until mutation `version` is done
    ///
    /// Fails as soon as an attempt to apply it fails; the scheduler keeps
    /// retrying in the background.
    pub async fn wait_for_mutation(
        &self,
        database: &str,
        table: &str,
        version: u64,
    ) -> SchedulerResult<()> {
        let handle = self.shared.table(database, table)?;
        let mut changes = handle.subscribe_mutations();
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                return Err(SchedulerError::Shutdown);
            }
            match handle.mutation(version) {
                None => {
                    return Err(SchedulerError::MutationNotFound {
                        database: database.to_string(),
                        table: table.to_string(),
                        version,
                    })
                }
                Some(entry) if entry.is_done => return Ok(()),
                Some(entry) if entry.fail_count > 0 => {
                    return Err(SchedulerError::ExecutionFailure {
                        database: database.to_string(),
                        table: table.to_string(),
                        result_part: entry.latest_failed_part.unwrap_or_default(),
                        reason: entry.latest_fail_reason.unwrap_or_default(),
                    })
                }
                Some(_) => {}
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(SchedulerError::Shutdown);
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    pub fn mutations(&self, database: &str, table: &str) -> SchedulerResult<Vec<MutationEntry>> {
        Ok(self.shared.table(database, table)?.mutations())
    }

    /// Wait until this replica applied everything already in a replicated table's log
    pub async fn sync_table(&self, database: &str, table: &str) -> SchedulerResult<()> {
        let table = self.shared.table(database, table)?;
        if let Some(log) = table.replication() {
            log.sync().await?;
        }
        Ok(())
    }

    /// Stop the workers and log pullers between tasks and fail queued manual merges
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
        self.shared.queue.lock().clear();
        for table in self.shared.tables.read().values() {
            if let Some(log) = table.replication() {
                log.stop();
            }
        }

        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        handles.extend(std::mem::take(&mut *self.pullers.lock()).into_values());
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("Merge scheduler stopped");
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
    }
}

impl Shared {
    fn table(&self, database: &str, table: &str) -> SchedulerResult<Arc<MergeTreeTable>> {
        self.tables
            .read()
            .get(&(database.to_string(), table.to_string()))
            .cloned()
            .ok_or_else(|| SchedulerError::TableNotFound {
                database: database.to_string(),
                table: table.to_string(),
            })
    }

    /// Queued task first, then a selection pass starting at a rotating table
    fn next_task(&self) -> Option<QueuedTask> {
        if let Some(task) = self.queue.lock().pop_front() {
            return Some(task);
        }

        let tables: Vec<Arc<MergeTreeTable>> = self.tables.read().values().cloned().collect();
        if tables.is_empty() {
            return None;
        }
        let start = self.next_table.fetch_add(1, Ordering::Relaxed);
        for i in 0..tables.len() {
            let table = &tables[(start + i) % tables.len()];
            if let Some((job, reservation)) = table.select_job(self.selector.as_ref()) {
                return Some(QueuedTask {
                    table: Arc::clone(table),
                    job,
                    reservation,
                    reply: None,
                });
            }
        }
        None
    }

    /// Run one task and report its result to the waiter, if any
    async fn run_task(&self, task: QueuedTask) -> SchedulerResult<String> {
        let QueuedTask {
            table,
            job,
            reservation,
            reply,
        } = task;
        let result_name = job.result.name();

        let result = self.execute(&table, &job).await;
        drop(reservation);

        match &result {
            Ok(_) => {
                tracing::info!(
                    database = %table.database(),
                    table = %table.name(),
                    result = %result_name,
                    sources = job.sources.len(),
                    is_mutation = job.is_mutation(),
                    "Task finished"
                );
            }
            Err(e) => {
                tracing::warn!(
                    database = %table.database(),
                    table = %table.name(),
                    result = %result_name,
                    error = %e,
                    "Task failed, sources kept"
                );
                if job.is_mutation() {
                    let source = job.source_names().join(",");
                    table.record_mutation_failure(&job.mutation_versions(), &source, &e.to_string());
                }
            }
        }
        table.refresh_mutations();

        if let Some(reply) = reply {
            let _ = reply.send(result.clone());
        }
        result
    }

    /// Append a selected job to the table log and wait until this replica applied it
    ///
    /// The caller keeps the job's reservation until this returns, so the same
    /// parts are not selected twice in the meantime.
    async fn publish(&self, log: &TableLog, job: &MergeJob) -> SchedulerResult<EntryOutcome> {
        let sequence_id = log.append(TableLogEntry::from(job)).await?;
        tracing::debug!(
            log = %log.path(),
            sequence_id,
            result = %job.result.name(),
            "Published task"
        );
        Ok(log.wait_outcome(sequence_id).await?)
    }

    /// Selected task of a replicated table: publish instead of running it
    async fn publish_task(&self, task: QueuedTask) -> bool {
        let Some(log) = task.table.replication() else {
            return false;
        };
        let outcome = self.publish(log, &task.job).await;
        drop(task.reservation);
        match outcome {
            Ok(EntryOutcome::Applied) | Ok(EntryOutcome::Skipped(_)) => true,
            Ok(EntryOutcome::Failed(reason)) => {
                tracing::debug!(table = %task.table.name(), reason = %reason, "Published task failed locally");
                false
            }
            Err(e) => {
                tracing::warn!(table = %task.table.name(), error = %e, "Failed to publish task");
                false
            }
        }
    }

    /// Apply one log entry to the local parts
    async fn apply_entry(&self, table: &Arc<MergeTreeTable>, logged: &LoggedEntry) -> EntryOutcome {
        let outcome = match &logged.entry {
            TableLogEntry::GetPart {
                part_name,
                columns,
                rows,
            } => table
                .fetch_part(part_name, columns.clone(), rows.clone())
                .unwrap_or_else(|e| EntryOutcome::Failed(e.to_string())),
            TableLogEntry::Mutation { version, command } => {
                table.register_mutation(*version, command.clone());
                EntryOutcome::Applied
            }
            entry => match table.logged_job(entry) {
                Ok((job, reservation)) => {
                    let task = QueuedTask {
                        table: Arc::clone(table),
                        job,
                        reservation,
                        reply: None,
                    };
                    match self.run_task(task).await {
                        Ok(_) => EntryOutcome::Applied,
                        Err(e) => EntryOutcome::Failed(e.to_string()),
                    }
                }
                Err(reason) => EntryOutcome::Skipped(reason),
            },
        };
        if let EntryOutcome::Skipped(reason) = &outcome {
            tracing::debug!(
                table = %table.name(),
                sequence_id = logged.sequence_id,
                kind = logged.entry.kind(),
                reason = %reason,
                "Skipped table log entry"
            );
        }
        outcome
    }

    /// Apply new entries in order, stopping at the first failure
    async fn pull(&self, table: &Arc<MergeTreeTable>, log: &TableLog) -> SchedulerResult<()> {
        let entries = log.entries_from(log.next_to_apply()).await?;
        if entries.is_empty() {
            return Ok(());
        }
        for logged in &entries {
            if self.shutdown.load(Ordering::SeqCst) || log.is_stopped() {
                break;
            }
            let outcome = self.apply_entry(table, logged).await;
            let failed = matches!(outcome, EntryOutcome::Failed(_));
            log.finish(logged, outcome);
            if failed {
                break;
            }
        }
        log.save_pointer().await?;
        self.work.notify_one();
        Ok(())
    }

    async fn execute(&self, table: &MergeTreeTable, job: &MergeJob) -> SchedulerResult<String> {
        let registry = table.registry();
        let result_name = job.result.name();
        let record = job.record(
            table.database(),
            table.name(),
            registry.part_path(&result_name),
        );
        let _progress = self.progress.register(record.clone())?;

        let failure = |reason: String| SchedulerError::ExecutionFailure {
            database: table.database().to_string(),
            table: table.name().to_string(),
            result_part: result_name.clone(),
            reason,
        };

        self.hook.before_execute(&record).await.map_err(failure)?;
        let rows = self
            .transformer
            .transform(job)
            .await
            .map_err(|e| failure(e.to_string()))?;

        let part = registry.build_part(job.result.clone(), job.columns.clone(), rows);
        registry
            .replace(&job.source_names(), part)
            .map_err(|e| failure(e.to_string()))?;
        if job.is_mutation() {
            tracing::debug!(
                table = %table.name(),
                part = %result_name,
                committed_version = registry.mutation_version(),
                "Mutated part published"
            );
        }
        Ok(result_name)
    }
}

async fn worker(shared: Arc<Shared>, id: usize, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.check_interval);
    tracing::debug!(worker = id, "Merge worker started");

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if let Some(task) = shared.next_task() {
            let succeeded = if task.table.is_replicated() {
                shared.publish_task(task).await
            } else {
                shared.run_task(task).await.is_ok()
            };
            if succeeded {
                continue;
            }
        }

        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.work.notified() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!(worker = id, "Merge worker stopped");
}

async fn puller(
    shared: Arc<Shared>,
    table: Arc<MergeTreeTable>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let Some(log) = table.replication() else {
        return;
    };
    let mut ticker = interval(shared.config.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut registered = false;
    tracing::debug!(table = %table.name(), log = %log.path(), "Table log puller started");

    loop {
        if *shutdown_rx.borrow() || log.is_stopped() {
            break;
        }
        if !registered {
            match log.register().await {
                Ok(()) => registered = true,
                Err(e) => tracing::warn!(log = %log.path(), error = %e, "Failed to register table replica"),
            }
        }

        // Watch before reading so an append in between still wakes us
        let watch = match log.watch().await {
            Ok(watch) => Some(watch),
            Err(e) => {
                tracing::debug!(log = %log.path(), error = %e, "Failed to watch table log");
                None
            }
        };

        if let Err(e) = shared.pull(&table, log).await {
            tracing::warn!(
                table = %table.name(),
                next = log.next_to_apply(),
                error = %e,
                "Failed to apply table log"
            );
        }

        let log_changed = async move {
            match watch {
                Some(watch) => {
                    let _ = watch.changed().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = log_changed => {}
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!(table = %table.name(), "Table log puller stopped");
}
