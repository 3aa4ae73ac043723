//! DDL log
//!
//! Entries are sequential children of `<db_path>/log`, named
//! `query-NNNNNNNNNN`. The store assigns the suffix, so concurrent appends from
//! different nodes still land in a single total order. Entries are never
//! modified after creation.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::coordination::{
    ensure_path, join_path, sequence_of, CoordinationStore, CreateMode,
};

use super::error::{ReplicationError, ReplicationResult};

/// Child node holding the entries
pub const LOG_NODE: &str = "log";

/// Name prefix of each entry node
pub const ENTRY_PREFIX: &str = "query-";

/// One schema change in the global order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlLogEntry {
    /// Assigned by the store, strictly increasing
    pub sequence_id: u64,
    pub database: String,
    pub statement_text: String,
    pub issuing_replica: String,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

/// Entry payload as stored; the sequence id lives in the node name
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    database: String,
    statement_text: String,
    issuing_replica: String,
    created_at: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle to the log of one replicated database
#[derive(Clone)]
pub struct DdlLog {
    store: Arc<dyn CoordinationStore>,
    database: String,
    log_path: String,
}

impl DdlLog {
    pub fn new(store: Arc<dyn CoordinationStore>, database: &str, db_path: &str) -> Self {
        Self {
            store,
            database: database.to_string(),
            log_path: join_path(db_path, LOG_NODE),
        }
    }

    pub fn path(&self) -> &str {
        &self.log_path
    }

    /// Create the log node if missing
    pub async fn init(&self) -> ReplicationResult<()> {
        ensure_path(self.store.as_ref(), &self.log_path).await?;
        Ok(())
    }

    /// Append a statement, returning its sequence id
    pub async fn append(
        &self,
        statement_text: &str,
        issuing_replica: &str,
    ) -> ReplicationResult<u64> {
        let payload = StoredEntry {
            database: self.database.clone(),
            statement_text: statement_text.to_string(),
            issuing_replica: issuing_replica.to_string(),
            created_at: now_millis(),
        };
        let data = serde_json::to_vec(&payload).map_err(|e| ReplicationError::CorruptEntry {
            path: self.log_path.clone(),
            reason: e.to_string(),
        })?;

        let path = self
            .store
            .create(
                &join_path(&self.log_path, ENTRY_PREFIX),
                Bytes::from(data),
                CreateMode::PersistentSequential,
            )
            .await?;

        let name = path.rsplit('/').next().unwrap_or_default();
        let sequence_id = sequence_of(name, ENTRY_PREFIX).ok_or_else(|| {
            ReplicationError::CorruptEntry {
                path: path.clone(),
                reason: "missing sequence suffix".to_string(),
            }
        })?;

        tracing::debug!(
            database = %self.database,
            sequence_id,
            replica = issuing_replica,
            "Appended DDL log entry"
        );
        Ok(sequence_id)
    }

    /// Sequence ids currently in the log, ascending
    pub async fn sequence_ids(&self) -> ReplicationResult<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .store
            .children(&self.log_path)
            .await?
            .iter()
            .filter_map(|name| sequence_of(name, ENTRY_PREFIX))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Highest sequence id in the log
    pub async fn tail(&self) -> ReplicationResult<Option<u64>> {
        Ok(self.sequence_ids().await?.last().copied())
    }

    /// All entries with `sequence_id >= from`, in order
    pub async fn entries_from(&self, from: u64) -> ReplicationResult<Vec<DdlLogEntry>> {
        let mut entries = Vec::new();
        for sequence_id in self.sequence_ids().await? {
            if sequence_id < from {
                continue;
            }
            entries.push(self.read_entry(sequence_id).await?);
        }
        Ok(entries)
    }

    async fn read_entry(&self, sequence_id: u64) -> ReplicationResult<DdlLogEntry> {
        let path = join_path(
            &self.log_path,
            &format!(
                "{}{:0width$}",
                ENTRY_PREFIX,
                sequence_id,
                width = crate::coordination::SEQUENCE_WIDTH
            ),
        );
        let (data, _) = self.store.get(&path).await?;
        let stored: StoredEntry =
            serde_json::from_slice(&data).map_err(|e| ReplicationError::CorruptEntry {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Ok(DdlLogEntry {
            sequence_id,
            database: stored.database,
            statement_text: stored.statement_text,
            issuing_replica: stored.issuing_replica,
            created_at: stored.created_at,
        })
    }

    /// Cursor yielding entries starting at `sequence_id`
    pub fn read_from(&self, sequence_id: u64) -> LogCursor {
        LogCursor {
            log: self.clone(),
            next: sequence_id,
        }
    }
}

/// Restartable position in the log
pub struct LogCursor {
    log: DdlLog,
    next: u64,
}

impl LogCursor {
    /// Move the cursor, e.g. back to the first unapplied entry
    pub fn seek(&mut self, sequence_id: u64) {
        self.next = sequence_id;
    }

    /// Entries from the current position up to the tail
    pub async fn poll(&mut self) -> ReplicationResult<Vec<DdlLogEntry>> {
        let entries = self.log.entries_from(self.next).await?;
        if let Some(last) = entries.last() {
            self.next = last.sequence_id + 1;
        }
        Ok(entries)
    }

}
