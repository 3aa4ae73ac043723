//! Replicated table log
//!
//! Every change to the parts of a replicated table is a sequential child of
//! `<zookeeper_path>/log`: new parts with their rows, registered mutations,
//! and the merges and part mutations some replica selected. Each replica
//! applies the log in order, so an entry meets the same set of parts on every
//! replica and a selection that another entry already covered is skipped the
//! same way everywhere. Entries are never modified or removed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::coordination::{
    ensure_path, join_path, sequence_of, with_retry, CoordinationError, CoordinationStore,
    CreateMode, RetryConfig, Watch, SEQUENCE_WIDTH,
};
use crate::parts::{Datum, PartError, PartResult};
use crate::sql::MutationCommand;

use super::transform::{JobKind, MergeJob};

/// Child node holding the entries
pub const TABLE_LOG_NODE: &str = "log";

/// Name prefix of each entry node
pub const ENTRY_PREFIX: &str = "log-";

/// Child node with one node per replica, holding its log pointer
pub const REPLICAS_NODE: &str = "replicas";

/// Outcomes of own entries kept for waiters
const MAX_OUTCOMES: usize = 1024;

/// One change to a replicated table's parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TableLogEntry {
    /// A freshly inserted part
    GetPart {
        part_name: String,
        columns: Vec<String>,
        rows: Vec<Vec<Datum>>,
    },
    /// A mutation registered at `version`
    Mutation {
        version: u64,
        command: MutationCommand,
    },
    MergeParts {
        sources: Vec<String>,
        result: String,
    },
    /// Rewrite of `source` applying `versions` in order
    MutatePart {
        source: String,
        result: String,
        versions: Vec<u64>,
    },
}

impl TableLogEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            TableLogEntry::GetPart { .. } => "get_part",
            TableLogEntry::Mutation { .. } => "mutation",
            TableLogEntry::MergeParts { .. } => "merge_parts",
            TableLogEntry::MutatePart { .. } => "mutate_part",
        }
    }
}

impl From<&MergeJob> for TableLogEntry {
    fn from(job: &MergeJob) -> Self {
        let result = job.result.name();
        match &job.kind {
            JobKind::Merge => TableLogEntry::MergeParts {
                sources: job.source_names(),
                result,
            },
            JobKind::Mutation { mutations } => TableLogEntry::MutatePart {
                source: job.source_names().into_iter().next().unwrap_or_default(),
                result,
                versions: mutations.iter().map(|(v, _)| *v).collect(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    issuing_replica: String,
    created_at: u64,
    entry: TableLogEntry,
}

/// Entry read back from the log
#[derive(Debug, Clone)]
pub struct LoggedEntry {
    pub sequence_id: u64,
    pub issuing_replica: String,
    pub entry: TableLogEntry,
}

/// What applying an entry did on this replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Applied,
    /// Nothing to do, e.g. the sources were already merged by an earlier entry
    Skipped(String),
    /// Left unapplied; the entry is retried
    Failed(String),
}

#[derive(Debug, Default)]
struct ApplyState {
    /// First sequence id not yet applied
    next: u64,
    outcomes: BTreeMap<u64, EntryOutcome>,
    stopped: bool,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn corrupt(path: &str, reason: impl std::fmt::Display) -> PartError {
    PartError::Replication(format!("corrupt table log entry {}: {}", path, reason))
}

/// Handle to one replica's view of a replicated table's log
pub struct TableLog {
    store: Arc<dyn CoordinationStore>,
    log_path: String,
    replica_path: String,
    replica_name: String,
    retry: RetryConfig,
    state: watch::Sender<ApplyState>,
}

impl TableLog {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        zookeeper_path: &str,
        replica_name: impl Into<String>,
        retry: RetryConfig,
    ) -> Self {
        let replica_name = replica_name.into();
        let (state, _) = watch::channel(ApplyState::default());
        Self {
            store,
            log_path: join_path(zookeeper_path, TABLE_LOG_NODE),
            replica_path: join_path(&join_path(zookeeper_path, REPLICAS_NODE), &replica_name),
            replica_name,
            retry,
            state,
        }
    }

    pub fn path(&self) -> &str {
        &self.log_path
    }

    pub fn replica_name(&self) -> &str {
        &self.replica_name
    }

    /// Create the log and this replica's node
    pub async fn register(&self) -> PartResult<()> {
        let store = self.store.as_ref();
        let (log_path, replica_path) = (self.log_path.as_str(), self.replica_path.as_str());
        with_retry(&self.retry, "register table replica", move || async move {
            ensure_path(store, log_path).await?;
            ensure_path(store, replica_path).await
        })
        .await?;
        tracing::debug!(log = %self.log_path, replica = %self.replica_name, "Registered table replica");
        Ok(())
    }

    /// Append an entry issued by this replica, returning its sequence id
    pub async fn append(&self, entry: TableLogEntry) -> PartResult<u64> {
        let kind = entry.kind();
        let stored = StoredEntry {
            issuing_replica: self.replica_name.clone(),
            created_at: now_millis(),
            entry,
        };
        let data = Bytes::from(serde_json::to_vec(&stored).map_err(|e| corrupt(&self.log_path, e))?);

        let store = self.store.as_ref();
        let log_path = self.log_path.as_str();
        let path = with_retry(&self.retry, "append table log entry", move || {
            let data = data.clone();
            async move {
                ensure_path(store, log_path).await?;
                store
                    .create(
                        &join_path(log_path, ENTRY_PREFIX),
                        data,
                        CreateMode::PersistentSequential,
                    )
                    .await
            }
        })
        .await?;

        let name = path.rsplit('/').next().unwrap_or_default();
        let sequence_id =
            sequence_of(name, ENTRY_PREFIX).ok_or_else(|| corrupt(&path, "missing sequence suffix"))?;
        tracing::debug!(log = %self.log_path, sequence_id, kind, "Appended table log entry");
        Ok(sequence_id)
    }

    async fn sequence_ids(&self) -> PartResult<Vec<u64>> {
        let children = match self.store.children(&self.log_path).await {
            Ok(children) => children,
            Err(CoordinationError::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids: Vec<u64> = children
            .iter()
            .filter_map(|name| sequence_of(name, ENTRY_PREFIX))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// All entries with `sequence_id >= from`, in order
    pub async fn entries_from(&self, from: u64) -> PartResult<Vec<LoggedEntry>> {
        let mut entries = Vec::new();
        for sequence_id in self.sequence_ids().await? {
            if sequence_id < from {
                continue;
            }
            let path = join_path(
                &self.log_path,
                &format!("{}{:0width$}", ENTRY_PREFIX, sequence_id, width = SEQUENCE_WIDTH),
            );
            let (data, _) = self.store.get(&path).await?;
            let stored: StoredEntry =
                serde_json::from_slice(&data).map_err(|e| corrupt(&path, e))?;
            entries.push(LoggedEntry {
                sequence_id,
                issuing_replica: stored.issuing_replica,
                entry: stored.entry,
            });
        }
        Ok(entries)
    }

    /// One-shot watch on new entries
    pub async fn watch(&self) -> PartResult<Watch> {
        ensure_path(self.store.as_ref(), &self.log_path).await?;
        Ok(self.store.watch_children(&self.log_path).await?)
    }

    /// First sequence id this replica has not applied
    pub fn next_to_apply(&self) -> u64 {
        self.state.borrow().next
    }

    /// Record the outcome of applying `entry`; the pointer only moves past entries that did not fail
    pub(crate) fn finish(&self, entry: &LoggedEntry, outcome: EntryOutcome) {
        let own = entry.issuing_replica == self.replica_name;
        self.state.send_modify(|state| {
            if !matches!(outcome, EntryOutcome::Failed(_)) {
                state.next = state.next.max(entry.sequence_id + 1);
            }
            if own {
                state.outcomes.insert(entry.sequence_id, outcome);
                while state.outcomes.len() > MAX_OUTCOMES {
                    state.outcomes.pop_first();
                }
            }
        });
    }

    /// Persist the log pointer in this replica's node
    pub(crate) async fn save_pointer(&self) -> PartResult<()> {
        let next = self.next_to_apply();
        self.store
            .set(&self.replica_path, Bytes::from(next.to_string()), None)
            .await?;
        Ok(())
    }

    /// Wait until this replica applied (or failed to apply) its own entry `sequence_id`
    pub async fn wait_outcome(&self, sequence_id: u64) -> PartResult<EntryOutcome> {
        let mut rx = self.state.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if let Some(outcome) = state.outcomes.get(&sequence_id) {
                    return Ok(outcome.clone());
                }
                if state.next > sequence_id {
                    return Err(PartError::Replication(format!(
                        "outcome of table log entry {} is no longer tracked",
                        sequence_id
                    )));
                }
                if state.stopped {
                    return Err(self.stopped());
                }
            }
            if rx.changed().await.is_err() {
                return Err(self.stopped());
            }
        }
    }

    /// Wait until every entry already in the log is applied
    pub async fn sync(&self) -> PartResult<()> {
        let Some(tail) = self.sequence_ids().await?.last().copied() else {
            return Ok(());
        };
        let mut rx = self.state.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if state.next > tail {
                    return Ok(());
                }
                if state.stopped {
                    return Err(self.stopped());
                }
            }
            if rx.changed().await.is_err() {
                return Err(self.stopped());
            }
        }
    }

    /// Fail current and future waiters
    pub fn stop(&self) {
        self.state.send_modify(|state| state.stopped = true);
    }

    pub fn is_stopped(&self) -> bool {
        self.state.borrow().stopped
    }

    fn stopped(&self) -> PartError {
        PartError::Replication(format!("table log {} is no longer followed", self.log_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryStore;
    use crate::sql::{Expr, Literal};

    fn log(store: &Arc<InMemoryStore>, replica: &str) -> TableLog {
        TableLog::new(store.clone(), "/clickhouse/t", replica, RetryConfig::default())
    }

    fn get_part(name: &str) -> TableLogEntry {
        TableLogEntry::GetPart {
            part_name: name.to_string(),
            columns: vec!["a".to_string()],
            rows: vec![vec![Datum::Int(1)]],
        }
    }

    #[tokio::test]
    async fn test_entries_are_shared_between_replicas() {
        let store = Arc::new(InMemoryStore::new());
        let r1 = log(&store, "1");
        let r2 = log(&store, "2");
        assert!(r2.entries_from(0).await.unwrap().is_empty());

        assert_eq!(r1.append(get_part("all_0_0_0")).await.unwrap(), 0);
        let mutation = TableLogEntry::Mutation {
            version: 1,
            command: MutationCommand::Delete {
                filter: Expr::Literal(Literal::Integer(1)),
            },
        };
        assert_eq!(r2.append(mutation.clone()).await.unwrap(), 1);

        let entries = r1.entries_from(0).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].issuing_replica, "1");
        assert_eq!(entries[0].entry, get_part("all_0_0_0"));
        assert_eq!(entries[1].issuing_replica, "2");
        assert_eq!(entries[1].entry, mutation);
        assert_eq!(r2.entries_from(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_and_pointer() {
        let store = Arc::new(InMemoryStore::new());
        let r1 = log(&store, "1");
        r1.register().await.unwrap();
        assert!(store.exists("/clickhouse/t/replicas/1").await.unwrap());

        let seq = r1.append(get_part("all_0_0_0")).await.unwrap();
        let entry = r1.entries_from(seq).await.unwrap().remove(0);
        r1.finish(&entry, EntryOutcome::Applied);
        r1.save_pointer().await.unwrap();
        let (data, _) = store.get("/clickhouse/t/replicas/1").await.unwrap();
        assert_eq!(&data[..], b"1");
    }

    #[tokio::test]
    async fn test_wait_outcome_and_retry_after_failure() {
        let store = Arc::new(InMemoryStore::new());
        let r1 = Arc::new(log(&store, "1"));
        let seq = r1.append(get_part("all_0_0_0")).await.unwrap();
        let entry = r1.entries_from(seq).await.unwrap().remove(0);

        let waiter = {
            let r1 = Arc::clone(&r1);
            tokio::spawn(async move { r1.wait_outcome(seq).await })
        };
        tokio::task::yield_now().await;
        r1.finish(&entry, EntryOutcome::Failed("disk full".to_string()));
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            EntryOutcome::Failed("disk full".to_string())
        );
        // A failed entry holds the pointer so it is applied again
        assert_eq!(r1.next_to_apply(), 0);

        r1.finish(&entry, EntryOutcome::Applied);
        assert_eq!(r1.next_to_apply(), 1);
        assert_eq!(r1.wait_outcome(seq).await.unwrap(), EntryOutcome::Applied);
        r1.sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_outcomes_of_other_replicas_are_not_kept() {
        let store = Arc::new(InMemoryStore::new());
        let r1 = log(&store, "1");
        let r2 = log(&store, "2");
        let seq = r2.append(get_part("all_0_0_0")).await.unwrap();
        let entry = r1.entries_from(seq).await.unwrap().remove(0);
        r1.finish(&entry, EntryOutcome::Applied);
        assert!(matches!(
            r1.wait_outcome(seq).await,
            Err(PartError::Replication(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_fails_waiters() {
        let store = Arc::new(InMemoryStore::new());
        let r1 = Arc::new(log(&store, "1"));
        r1.append(get_part("all_0_0_0")).await.unwrap();

        let syncing = {
            let r1 = Arc::clone(&r1);
            tokio::spawn(async move { r1.sync().await })
        };
        tokio::task::yield_now().await;
        r1.stop();
        assert!(syncing.await.unwrap().is_err());
        assert!(r1.wait_outcome(5).await.is_err());
        assert!(r1.is_stopped());
    }
}
