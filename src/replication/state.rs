//! Persisted replica state
//!
//! The state is a snapshot of the schema together with the last applied
//! sequence id. It is stored as JSON and replaced atomically, so a restart
//! resumes exactly after the last entry folded into the snapshot.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::schema::DatabaseSchema;

use super::error::{ReplicationError, ReplicationResult};

/// State file name
pub const REPLICA_STATE_FILE: &str = "REPLICA_STATE";

/// Lifecycle of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// Replaying the log; local DDL is rejected
    CatchingUp,
    /// Applying new entries as they arrive
    Active,
    /// An entry failed to apply; the database is halted
    Error,
}

impl std::fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaStatus::CatchingUp => write!(f, "catching_up"),
            ReplicaStatus::Active => write!(f, "active"),
            ReplicaStatus::Error => write!(f, "error"),
        }
    }
}

/// Everything a replica needs to resume after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub replica_name: String,
    /// Absent until the first entry is applied
    pub last_applied_sequence_id: Option<u64>,
    pub status: ReplicaStatus,
    /// Reason of the last apply failure
    pub error: Option<String>,
    /// Entry that failed to apply
    pub failed_sequence_id: Option<u64>,
    /// Fold of entries up to `last_applied_sequence_id`
    pub schema: DatabaseSchema,
}

impl ReplicaState {
    pub fn new(replica_name: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            replica_name: replica_name.into(),
            last_applied_sequence_id: None,
            status: ReplicaStatus::CatchingUp,
            error: None,
            failed_sequence_id: None,
            schema: DatabaseSchema::new(database),
        }
    }

    /// First sequence id not yet applied
    pub fn next_sequence_id(&self) -> u64 {
        self.last_applied_sequence_id.map_or(0, |seq| seq + 1)
    }

    /// Whether `sequence_id` is already folded into the schema
    pub fn has_applied(&self, sequence_id: u64) -> bool {
        self.last_applied_sequence_id
            .is_some_and(|last| sequence_id <= last)
    }
}

/// On-disk location of a replica's state
#[derive(Debug, Clone)]
pub struct StateFile {
    dir: PathBuf,
}

impl StateFile {
    /// Use `dir`, creating it if needed
    pub fn open(dir: &Path) -> ReplicationResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            ReplicationError::Persist(format!("failed to create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(REPLICA_STATE_FILE)
    }

    /// Load the saved state, if any
    pub fn load(&self) -> ReplicationResult<Option<ReplicaState>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ReplicationError::Persist(format!("failed to read {}: {}", path.display(), e))
        })?;
        let state = serde_json::from_str(&content).map_err(|e| {
            ReplicationError::Persist(format!("failed to parse replica state: {}", e))
        })?;
        Ok(Some(state))
    }

    /// Save using temp file, fsync and atomic rename
    pub fn save(&self, state: &ReplicaState) -> ReplicationResult<()> {
        let final_path = self.path();
        let temp_path = self.dir.join(format!("{}.tmp", REPLICA_STATE_FILE));

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            ReplicationError::Persist(format!("failed to serialize replica state: {}", e))
        })?;

        let io_err =
            |e: std::io::Error| ReplicationError::Persist(format!("failed to save state: {}", e));

        {
            let mut file = File::create(&temp_path).map_err(io_err)?;
            file.write_all(content.as_bytes()).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }

        std::fs::rename(&temp_path, &final_path).map_err(io_err)?;

        #[cfg(unix)]
        {
            if let Ok(dir) = File::open(&self.dir) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}
