//! Coordination store client
//!
//! The coordination store is an external ordered, durable, linearizable path
//! store (ZooKeeper-like). Everything that needs a global order across nodes
//! goes through it: the DDL log, replica registration, and block numbers of
//! replicated tables.
//!
//! This module only defines the contract the rest of the crate consumes, plus
//! an in-memory implementation used by tests and single-process deployments.

mod error;
mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::watch;

pub use error::{CoordinationError, CoordinationResult};
pub use memory::InMemoryStore;

/// Width of the numeric suffix appended by sequential creates
pub const SEQUENCE_WIDTH: usize = 10;

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Plain node at exactly the requested path
    Persistent,
    /// Node whose name gets a monotonically increasing suffix
    PersistentSequential,
}

/// Node metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Data version, bumped on every `set`
    pub version: i32,
    /// Number of children
    pub num_children: usize,
}

/// One-shot notification of a child-set change
pub struct Watch {
    rx: watch::Receiver<u64>,
}

impl Watch {
    pub(crate) fn new(rx: watch::Receiver<u64>) -> Self {
        Self { rx }
    }

    /// Wait until the watched node's children change
    pub async fn changed(mut self) -> CoordinationResult<()> {
        self.rx
            .changed()
            .await
            .map_err(|_| CoordinationError::Unavailable("watch channel closed".to_string()))
    }
}

/// Client interface to the coordination store
///
/// All operations are linearizable and durable on the store side.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a node, returning the actual path (with suffix for sequential nodes)
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode)
        -> CoordinationResult<String>;

    /// Read node data and metadata
    async fn get(&self, path: &str) -> CoordinationResult<(Bytes, Stat)>;

    /// Overwrite node data
    ///
    /// With `expected_version` set this is a compare-and-swap.
    async fn set(
        &self,
        path: &str,
        data: Bytes,
        expected_version: Option<i32>,
    ) -> CoordinationResult<Stat>;

    /// Check whether a node exists
    async fn exists(&self, path: &str) -> CoordinationResult<bool>;

    /// List child names in sorted order
    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>>;

    /// Register a one-shot watch on the child set of `path`
    async fn watch_children(&self, path: &str) -> CoordinationResult<Watch>;
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// Parse the sequence suffix from a sequential child name
///
/// `sequence_of("query-0000000007", "query-")` returns `Some(7)`.
pub fn sequence_of(name: &str, prefix: &str) -> Option<u64> {
    let suffix = name.strip_prefix(prefix)?;
    if suffix.len() != SEQUENCE_WIDTH {
        return None;
    }
    suffix.parse().ok()
}

/// Create `path` and all of its ancestors, tolerating nodes that already exist
pub async fn ensure_path(store: &dyn CoordinationStore, path: &str) -> CoordinationResult<()> {
    let mut current = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        current.push('/');
        current.push_str(component);
        match store
            .create(&current, Bytes::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) | Err(CoordinationError::PathExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Backoff policy for transient store failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before giving up (at least one)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Upper bound on a single delay
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt + 1`, with up to 50% random jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff);
        let jitter_ms = base.as_millis() as u64 / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }
}

/// Errors that may go away when the operation is retried
pub trait Retryable: std::fmt::Display {
    fn is_transient(&self) -> bool;
}

impl Retryable for CoordinationError {
    fn is_transient(&self) -> bool {
        CoordinationError::is_transient(self)
    }
}

/// Run `op`, retrying transient failures with exponential backoff
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt + 1 < config.max_attempts.max(1) => {
                let delay = config.backoff(attempt);
                tracing::warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Coordination store call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a/b", "c"), "/a/b/c");
        assert_eq!(join_path("/a/b/", "c"), "/a/b/c");
    }

    #[test]
    fn test_sequence_of() {
        assert_eq!(sequence_of("query-0000000007", "query-"), Some(7));
        assert_eq!(sequence_of("query-0000000000", "query-"), Some(0));
        assert_eq!(sequence_of("query-7", "query-"), None);
        assert_eq!(sequence_of("block-0000000001", "query-"), None);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        };
        for attempt in 0..20 {
            assert!(config.backoff(attempt) <= Duration::from_millis(60));
        }
    }

    #[tokio::test]
    async fn test_ensure_path_is_idempotent() {
        let store = InMemoryStore::new();
        ensure_path(&store, "/clickhouse/databases/test1").await.unwrap();
        ensure_path(&store, "/clickhouse/databases/test1").await.unwrap();
        assert!(store.exists("/clickhouse/databases").await.unwrap());
        assert!(store.exists("/clickhouse/databases/test1").await.unwrap());
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default();
        let result: CoordinationResult<()> = with_retry(&config, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoordinationError::NoNode("/x".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(CoordinationError::NoNode(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let result = with_retry(&config, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CoordinationError::Unavailable("down".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
