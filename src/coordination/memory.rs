//! In-memory coordination store
//!
//! A single mutex serializes every operation, which makes the store trivially
//! linearizable. Durability is the lifetime of the process. Tests share one
//! instance between several nodes to model a cluster.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{
    CoordinationError, CoordinationResult, CoordinationStore, CreateMode, Stat, Watch,
    SEQUENCE_WIDTH,
};

#[derive(Debug, Default)]
struct StoreNode {
    data: Bytes,
    version: i32,
    children: BTreeSet<String>,
    /// Next suffix handed out to a sequential child
    next_sequence: u64,
}

#[derive(Debug)]
struct StoreState {
    nodes: HashMap<String, StoreNode>,
    /// Child watches by path; the value is a change counter
    watchers: HashMap<String, watch::Sender<u64>>,
}

/// In-memory implementation of [`CoordinationStore`]
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create a store containing only the root node
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), StoreNode::default());
        Self {
            state: Mutex::new(StoreState {
                nodes,
                watchers: HashMap::new(),
            }),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the connection to the store
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        tracing::info!(available, "Coordination store availability changed");
    }

    fn check_available(&self) -> CoordinationResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordinationError::Unavailable(
                "connection to coordination store lost".to_string(),
            ))
        }
    }
}

fn validate_path(path: &str) -> CoordinationResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(CoordinationError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Split `/a/b/c` into (`/a/b`, `c`)
fn split_parent(path: &str) -> CoordinationResult<(&str, &str)> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Ok(("/", &path[1..])),
        Some(idx) if idx > 0 => Ok((&path[..idx], &path[idx + 1..])),
        _ => Err(CoordinationError::InvalidPath(path.to_string())),
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn create(
        &self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        self.check_available()?;
        validate_path(path)?;
        let (parent, name) = split_parent(path)?;

        let mut state = self.state.lock();
        let parent_node = state
            .nodes
            .get_mut(parent)
            .ok_or_else(|| CoordinationError::NoNode(parent.to_string()))?;

        let (actual_path, child_name) = match mode {
            CreateMode::PersistentSequential => {
                let seq = parent_node.next_sequence;
                parent_node.next_sequence += 1;
                let child = format!("{}{:0width$}", name, seq, width = SEQUENCE_WIDTH);
                (format!("{}{:0width$}", path, seq, width = SEQUENCE_WIDTH), child)
            }
            CreateMode::Persistent => {
                if parent_node.children.contains(name) {
                    return Err(CoordinationError::PathExists(path.to_string()));
                }
                (path.to_string(), name.to_string())
            }
        };

        parent_node.children.insert(child_name);
        state.nodes.insert(
            actual_path.clone(),
            StoreNode {
                data,
                ..Default::default()
            },
        );

        if let Some(tx) = state.watchers.get(parent) {
            tx.send_modify(|changes| *changes += 1);
        }

        Ok(actual_path)
    }

    async fn get(&self, path: &str) -> CoordinationResult<(Bytes, Stat)> {
        self.check_available()?;
        let state = self.state.lock();
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        Ok((
            node.data.clone(),
            Stat {
                version: node.version,
                num_children: node.children.len(),
            },
        ))
    }

    async fn set(
        &self,
        path: &str,
        data: Bytes,
        expected_version: Option<i32>,
    ) -> CoordinationResult<Stat> {
        self.check_available()?;
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;

        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(CoordinationError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }

        node.data = data;
        node.version += 1;
        Ok(Stat {
            version: node.version,
            num_children: node.children.len(),
        })
    }

    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        self.check_available()?;
        Ok(self.state.lock().nodes.contains_key(path))
    }

    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.check_available()?;
        let state = self.state.lock();
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        Ok(node.children.iter().cloned().collect())
    }

    async fn watch_children(&self, path: &str) -> CoordinationResult<Watch> {
        self.check_available()?;
        let mut state = self.state.lock();
        if !state.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        let rx = state
            .watchers
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe();
        Ok(Watch::new(rx))
    }
}
