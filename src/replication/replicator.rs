//! DDL replicator
//!
//! One replicator runs per replica of a replicated database. It tails the DDL
//! log, applies entries strictly in log order, and persists its position after
//! every entry. A replica that starts without saved state replays the log from
//! the first entry, which is what makes late joiners converge.
//!
//! Status transitions:
//! - `CatchingUp -> Active` once the log tail has been applied
//! - `CatchingUp | Active -> Error` when an entry fails to apply
//! - `Error -> CatchingUp` on [`DdlReplicator::retry`]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::coordination::{
    ensure_path, join_path, with_retry, CoordinationError, CoordinationStore, CreateMode,
    RetryConfig,
};
use crate::schema::DatabaseSchema;
use crate::sql::Parser;

use super::error::{ReplicationError, ReplicationResult};
use super::log::{DdlLog, DdlLogEntry, LogCursor};
use super::state::{ReplicaState, ReplicaStatus, StateFile};

/// Child node under which replicas register
pub const REPLICAS_NODE: &str = "replicas";

/// Default fallback poll period
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Replicator configuration
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// How often the log is polled when no watch notification arrives
    pub poll_interval: Duration,
    /// Backoff for store calls made on behalf of a client
    pub retry: RetryConfig,
    /// Directory for the persisted replica state; `None` keeps it in memory
    pub state_dir: Option<PathBuf>,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryConfig::default(),
            state_dir: None,
        }
    }
}

impl ReplicatorConfig {
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Observable replica position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaProgress {
    pub status: ReplicaStatus,
    pub last_applied: Option<u64>,
    pub failed_sequence: Option<u64>,
    pub error: Option<String>,
    /// Last failure to save the state file; cleared by the next successful save
    pub persist_error: Option<String>,
}

impl From<&ReplicaState> for ReplicaProgress {
    fn from(state: &ReplicaState) -> Self {
        Self {
            status: state.status,
            last_applied: state.last_applied_sequence_id,
            failed_sequence: state.failed_sequence_id,
            error: state.error.clone(),
            persist_error: None,
        }
    }
}

struct Shared {
    database: String,
    replica_name: String,
    /// `<db_path>/replicas/<replica_name>`
    replica_path: String,
    store: Arc<dyn CoordinationStore>,
    log: DdlLog,
    config: ReplicatorConfig,
    state: RwLock<ReplicaState>,
    state_file: Option<StateFile>,
    progress_tx: watch::Sender<ReplicaProgress>,
    wake: Notify,
    /// Version of the replica node last written by us
    pointer_version: Mutex<Option<i32>>,
}

/// Replicator for one replica of one database
pub struct DdlReplicator {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DdlReplicator {
    /// Register the replica and start tailing the log
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        database: &str,
        db_path: &str,
        replica_name: &str,
        config: ReplicatorConfig,
    ) -> ReplicationResult<Self> {
        let log = DdlLog::new(store.clone(), database, db_path);
        let replicas_path = join_path(db_path, REPLICAS_NODE);
        let replica_path = join_path(&replicas_path, replica_name);

        {
            let store_ref = store.as_ref();
            let log_ref = &log;
            let replicas = replicas_path.as_str();
            with_retry(&config.retry, "create database paths", move || async move {
                log_ref.init().await?;
                ensure_path(store_ref, replicas).await?;
                Ok::<(), ReplicationError>(())
            })
            .await?;

            let replica = replica_path.as_str();
            with_retry(&config.retry, "register replica", move || async move {
                match store_ref
                    .create(replica, Bytes::new(), CreateMode::Persistent)
                    .await
                {
                    Ok(_) | Err(CoordinationError::PathExists(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            })
            .await?;
        }
        let (_, stat) = store.get(&replica_path).await?;

        let state_file = match &config.state_dir {
            Some(dir) => Some(StateFile::open(dir)?),
            None => None,
        };
        let mut state = match state_file.as_ref().map(|f| f.load()).transpose()?.flatten() {
            Some(saved) if saved.schema.name() == database => {
                tracing::info!(
                    database,
                    replica = replica_name,
                    last_applied = ?saved.last_applied_sequence_id,
                    "Resuming replica from saved state"
                );
                saved
            }
            Some(saved) => {
                tracing::warn!(
                    database,
                    saved_database = saved.schema.name(),
                    "Ignoring replica state of another database"
                );
                ReplicaState::new(replica_name, database)
            }
            None => ReplicaState::new(replica_name, database),
        };
        state.replica_name = replica_name.to_string();
        state.status = ReplicaStatus::CatchingUp;
        state.error = None;
        state.failed_sequence_id = None;

        let (progress_tx, _) = watch::channel(ReplicaProgress::from(&state));
        let shared = Arc::new(Shared {
            database: database.to_string(),
            replica_name: replica_name.to_string(),
            replica_path,
            store,
            log,
            config,
            state: RwLock::new(state),
            state_file,
            progress_tx,
            wake: Notify::new(),
            pointer_version: Mutex::new(Some(stat.version)),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(shared.clone(), shutdown_rx));

        tracing::info!(
            database,
            replica = replica_name,
            db_path,
            "DDL replicator started"
        );

        Ok(Self {
            shared,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn database(&self) -> &str {
        &self.shared.database
    }

    pub fn replica_name(&self) -> &str {
        &self.shared.replica_name
    }

    pub fn log(&self) -> &DdlLog {
        &self.shared.log
    }

    pub fn status(&self) -> ReplicaStatus {
        self.shared.state.read().status
    }

    pub fn progress(&self) -> ReplicaProgress {
        self.shared.progress_tx.borrow().clone()
    }

    /// Receiver notified on every status or position change
    pub fn subscribe(&self) -> watch::Receiver<ReplicaProgress> {
        self.shared.progress_tx.subscribe()
    }

    /// Copy of the current schema
    pub fn schema(&self) -> DatabaseSchema {
        self.shared.state.read().schema.clone()
    }

    /// Run `f` against the current schema without copying it
    pub fn with_schema<R>(&self, f: impl FnOnce(&DatabaseSchema) -> R) -> R {
        f(&self.shared.state.read().schema)
    }

    /// Log a schema change and wait until this replica has applied it
    ///
    /// The statement is parsed and validated against the local schema first;
    /// invalid statements are rejected without being logged.
    pub async fn execute(&self, statement_text: &str) -> ReplicationResult<u64> {
        let statement = Parser::parse_ddl(statement_text)?;
        self.check_active()?;

        // Validate against everything already logged
        self.sync().await?;
        self.shared
            .state
            .read()
            .schema
            .clone()
            .apply_statement(&statement, u64::MAX)?;

        let log = &self.shared.log;
        let replica = self.shared.replica_name.as_str();
        let sequence_id = with_retry(&self.shared.config.retry, "append DDL entry", move || {
            log.append(statement_text, replica)
        })
        .await?;

        self.shared.wake.notify_one();
        self.wait_applied(sequence_id).await?;
        Ok(sequence_id)
    }

    /// Wait until the entry `sequence_id` has been applied locally
    pub async fn wait_applied(&self, sequence_id: u64) -> ReplicationResult<()> {
        let mut rx = self.shared.progress_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            {
                let progress = rx.borrow_and_update();
                if progress.last_applied.is_some_and(|last| last >= sequence_id) {
                    return Ok(());
                }
                if progress.status == ReplicaStatus::Error {
                    return Err(ReplicationError::ApplyFailure {
                        database: self.shared.database.clone(),
                        sequence_id: progress.failed_sequence.unwrap_or(sequence_id),
                        reason: progress.error.clone().unwrap_or_default(),
                    });
                }
            }
            if *shutdown_rx.borrow() {
                return Err(ReplicationError::Shutdown);
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ReplicationError::Shutdown);
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Wait until every entry currently in the log has been applied
    pub async fn sync(&self) -> ReplicationResult<()> {
        let log = &self.shared.log;
        let tail = with_retry(&self.shared.config.retry, "read DDL log tail", move || {
            log.tail()
        })
        .await?;
        match tail {
            Some(sequence_id) => {
                self.shared.wake.notify_one();
                self.wait_applied(sequence_id).await
            }
            None => Ok(()),
        }
    }

    /// Wait until the initial replay finished (or failed)
    pub async fn wait_active(&self) -> ReplicationResult<()> {
        let mut rx = self.shared.progress_tx.subscribe();
        loop {
            let status = rx.borrow_and_update().status;
            match status {
                ReplicaStatus::Active => return Ok(()),
                ReplicaStatus::Error => {
                    let progress = self.progress();
                    return Err(ReplicationError::ApplyFailure {
                        database: self.shared.database.clone(),
                        sequence_id: progress.failed_sequence.unwrap_or_default(),
                        reason: progress.error.unwrap_or_default(),
                    });
                }
                ReplicaStatus::CatchingUp => {}
            }
            rx.changed()
                .await
                .map_err(|_| ReplicationError::Shutdown)?;
        }
    }

    /// Leave the error state and replay from the last applied entry
    pub fn retry(&self) {
        if self.status() != ReplicaStatus::Error {
            return;
        }
        self.shared.update(|state| {
            state.status = ReplicaStatus::CatchingUp;
            state.error = None;
            state.failed_sequence_id = None;
        });
        tracing::info!(
            database = %self.shared.database,
            replica = %self.shared.replica_name,
            "Retrying replica after apply failure"
        );
        self.shared.wake.notify_one();
    }

    /// Stop the background task
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn check_active(&self) -> ReplicationResult<()> {
        let state = self.shared.state.read();
        match state.status {
            ReplicaStatus::Active => Ok(()),
            ReplicaStatus::CatchingUp => Err(ReplicationError::NotYetActive {
                database: self.shared.database.clone(),
            }),
            ReplicaStatus::Error => Err(ReplicationError::ApplyFailure {
                database: self.shared.database.clone(),
                sequence_id: state.failed_sequence_id.unwrap_or_default(),
                reason: state.error.clone().unwrap_or_default(),
            }),
        }
    }
}

impl Drop for DdlReplicator {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl Shared {
    fn status(&self) -> ReplicaStatus {
        self.state.read().status
    }

    fn next_sequence_id(&self) -> u64 {
        self.state.read().next_sequence_id()
    }

    /// Mutate the state, then persist and publish the result
    fn update(&self, f: impl FnOnce(&mut ReplicaState)) {
        let snapshot = {
            let mut state = self.state.write();
            f(&mut state);
            state.clone()
        };
        self.publish(&snapshot);
    }

    /// Persist a state snapshot and make it observable
    fn publish(&self, state: &ReplicaState) {
        let mut progress = ReplicaProgress::from(state);
        progress.persist_error = self.persist(state);
        self.progress_tx.send_replace(progress);
    }

    /// Save the state file, returning the failure if any
    ///
    /// After a failed save a restart resumes from an older position and
    /// re-applies the entries after it.
    fn persist(&self, state: &ReplicaState) -> Option<String> {
        let file = self.state_file.as_ref()?;
        let e = file.save(state).err()?;
        tracing::error!(
            database = %self.database,
            replica = %self.replica_name,
            sequence_id = ?state.last_applied_sequence_id,
            path = %file.path().display(),
            error = %e,
            "Failed to persist replica state"
        );
        Some(e.to_string())
    }

    /// Read new entries and apply them
    async fn catch_up(&self, cursor: &mut LogCursor) {
        if self.status() == ReplicaStatus::Error {
            return;
        }

        cursor.seek(self.next_sequence_id());
        let entries = match cursor.poll().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    database = %self.database,
                    error = %e,
                    "Failed to read DDL log"
                );
                return;
            }
        };

        if !self.apply_entries(&entries) {
            return;
        }
        if self.status() == ReplicaStatus::CatchingUp {
            self.update(|state| state.status = ReplicaStatus::Active);
            tracing::info!(
                database = %self.database,
                replica = %self.replica_name,
                last_applied = ?self.state.read().last_applied_sequence_id,
                "Replica caught up with DDL log"
            );
        }
        if !entries.is_empty() {
            self.publish_log_pointer().await;
        }
    }

    /// Apply entries in order; stops at the first failure
    fn apply_entries(&self, entries: &[DdlLogEntry]) -> bool {
        for entry in entries {
            let mut failed = false;
            let snapshot = {
                let mut state = self.state.write();
                if state.has_applied(entry.sequence_id) {
                    continue;
                }
                match state.schema.apply(entry) {
                    Ok(change) => {
                        state.last_applied_sequence_id = Some(entry.sequence_id);
                        tracing::info!(
                            database = %self.database,
                            replica = %self.replica_name,
                            sequence_id = entry.sequence_id,
                            issuer = %entry.issuing_replica,
                            ?change,
                            "Applied DDL entry"
                        );
                    }
                    Err(e) => {
                        state.status = ReplicaStatus::Error;
                        state.error = Some(e.to_string());
                        state.failed_sequence_id = Some(entry.sequence_id);
                        tracing::error!(
                            database = %self.database,
                            replica = %self.replica_name,
                            sequence_id = entry.sequence_id,
                            statement = %entry.statement_text,
                            error = %e,
                            "Failed to apply DDL entry, replica halted"
                        );
                        failed = true;
                    }
                }
                state.clone()
            };
            self.publish(&snapshot);
            if failed {
                return false;
            }
        }
        true
    }

    /// Mirror the applied position to the replica node with compare-and-swap
    async fn publish_log_pointer(&self) {
        let Some(last) = self.state.read().last_applied_sequence_id else {
            return;
        };
        let expected = *self.pointer_version.lock();
        match self
            .store
            .set(&self.replica_path, Bytes::from(last.to_string()), expected)
            .await
        {
            Ok(stat) => *self.pointer_version.lock() = Some(stat.version),
            Err(CoordinationError::BadVersion { actual, .. }) => {
                tracing::warn!(
                    path = %self.replica_path,
                    "Replica log pointer was changed by someone else"
                );
                *self.pointer_version.lock() = Some(actual);
            }
            Err(e) => {
                tracing::debug!(
                    path = %self.replica_path,
                    error = %e,
                    "Failed to publish replica log pointer"
                );
            }
        }
    }
}

async fn run(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut cursor = shared.log.read_from(shared.next_sequence_id());
    let mut ticker = interval(shared.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Watch before polling so an append in between still wakes us
        let watch = match shared.store.watch_children(shared.log.path()).await {
            Ok(watch) => Some(watch),
            Err(e) => {
                tracing::debug!(
                    database = %shared.database,
                    error = %e,
                    "Failed to watch DDL log"
                );
                None
            }
        };

        shared.catch_up(&mut cursor).await;

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
            _ = shared.wake.notified() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!(
        database = %shared.database,
        replica = %shared.replica_name,
        "DDL replicator shutting down"
    );
}
