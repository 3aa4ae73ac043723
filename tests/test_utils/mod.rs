//! Shared test utilities
//!
//! Note: clippy reports false-positive dead_code warnings because it can't
//! trace usage across test binaries. These utilities are used by multiple tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use coldb::coordination::{CoordinationStore, InMemoryStore};
use coldb::merge::{ExecutionRecord, SchedulerConfig, TaskHook};
use coldb::node::{Node, NodeConfig, QueryResult};
use coldb::replication::ReplicatorConfig;

/// Statement creating the replicated database every replicated test uses
pub const CREATE_TESTDB: &str =
    "CREATE DATABASE testdb ENGINE = Replicated('/clickhouse/databases/test1', '{replica}');";

/// Fresh in-memory coordination store shared by the nodes of one test
pub fn test_store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new())
}

/// Node configuration with short intervals so tests never wait on timers
pub fn test_config(name: &str) -> NodeConfig {
    NodeConfig::new(name)
        .with_scheduler(
            SchedulerConfig::new()
                .with_workers(2)
                .with_check_interval(Duration::from_millis(50)),
        )
        .with_replicator(ReplicatorConfig::default().with_poll_interval(Duration::from_millis(50)))
}

pub fn start_node(name: &str, store: &Arc<InMemoryStore>) -> Node {
    let store: Arc<dyn CoordinationStore> = store.clone();
    Node::start(test_config(name), store)
}

/// Node whose replica state survives restarts in `state_dir`
pub fn start_persistent_node(name: &str, store: &Arc<InMemoryStore>, state_dir: &Path) -> Node {
    let store: Arc<dyn CoordinationStore> = store.clone();
    Node::start(test_config(name).with_state_dir(state_dir), store)
}

/// Node running every merge and mutation through `hook`
pub fn start_node_with_hook(
    name: &str,
    store: &Arc<InMemoryStore>,
    hook: Arc<dyn TaskHook>,
) -> Node {
    let store: Arc<dyn CoordinationStore> = store.clone();
    Node::builder(test_config(name), store).hook(hook).start()
}

/// Run a statement that must succeed
pub async fn exec(node: &Node, sql: &str) -> QueryResult {
    match node.query(sql).await {
        Ok(result) => result,
        Err(e) => panic!("{} failed on {}: {}", sql, node.name(), e),
    }
}

/// DESC output after `node` has applied everything already logged for `database`
pub async fn synced_describe(node: &Node, database: &str, table: &str) -> String {
    node.sync(database).await.unwrap();
    node.describe_tsv(database, table).unwrap()
}

/// Split tab-separated output into rows of fields
pub fn split_tsv(data: &str) -> Vec<Vec<String>> {
    data.lines()
        .map(|line| line.split('\t').map(str::to_string).collect())
        .collect()
}

/// Hook that holds each task until released
///
/// Tests use it to observe `system.merges` while a task is in flight.
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    /// Wait until a task reached the hook
    pub async fn wait_entered(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.entered.notified())
            .await
            .expect("no task reached the gate");
    }

    /// Let one held task continue
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl TaskHook for Gate {
    async fn before_execute(&self, _record: &ExecutionRecord) -> Result<(), String> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

/// Hook failing the first `n` tasks
pub struct FailFirst {
    remaining: parking_lot::Mutex<usize>,
}

impl FailFirst {
    pub fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: parking_lot::Mutex::new(n),
        })
    }
}

#[async_trait]
impl TaskHook for FailFirst {
    async fn before_execute(&self, _record: &ExecutionRecord) -> Result<(), String> {
        let mut remaining = self.remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err("injected failure".to_string());
        }
        Ok(())
    }
}
