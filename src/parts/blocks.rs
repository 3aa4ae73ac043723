//! Block number allocation
//!
//! Inserts and mutations draw from one increasing sequence per table, so a
//! mutation version orders against the blocks it must rewrite. Plain tables
//! count locally from 1; replicated tables create sequential nodes under
//! `<zookeeper_path>/block_numbers/<partition>` and start at 0.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::coordination::{
    ensure_path, join_path, sequence_of, with_retry, CoordinationError, CoordinationStore,
    CreateMode, RetryConfig,
};

use super::error::PartResult;

const BLOCK_NUMBERS_NODE: &str = "block_numbers";
const BLOCK_PREFIX: &str = "block-";

/// Source of block numbers for one table
pub enum BlockAllocator {
    Local(AtomicU64),
    Coordinated {
        store: Arc<dyn CoordinationStore>,
        zookeeper_path: String,
        retry: RetryConfig,
    },
}

impl BlockAllocator {
    /// Local counter whose first block is 1
    pub fn local() -> Self {
        BlockAllocator::Local(AtomicU64::new(1))
    }

    pub fn coordinated(
        store: Arc<dyn CoordinationStore>,
        zookeeper_path: impl Into<String>,
        retry: RetryConfig,
    ) -> Self {
        BlockAllocator::Coordinated {
            store,
            zookeeper_path: zookeeper_path.into(),
            retry,
        }
    }

    /// Allocate the next block number in `partition_id`
    pub async fn allocate(&self, partition_id: &str) -> PartResult<u64> {
        match self {
            BlockAllocator::Local(next) => Ok(next.fetch_add(1, Ordering::SeqCst)),
            BlockAllocator::Coordinated {
                store,
                zookeeper_path,
                retry,
            } => {
                let parent = join_path(
                    &join_path(zookeeper_path, BLOCK_NUMBERS_NODE),
                    partition_id,
                );
                let store = store.as_ref();
                let parent = parent.as_str();
                let block = with_retry(retry, "allocate block", move || async move {
                    ensure_path(store, parent).await?;
                    let path = store
                        .create(
                            &join_path(parent, BLOCK_PREFIX),
                            Bytes::new(),
                            CreateMode::PersistentSequential,
                        )
                        .await?;
                    let name = path.rsplit('/').next().unwrap_or_default();
                    sequence_of(name, BLOCK_PREFIX).ok_or_else(|| {
                        CoordinationError::InvalidPath(format!("no block number in {}", path))
                    })
                })
                .await?;
                tracing::debug!(zookeeper_path = %zookeeper_path, partition_id, block, "Allocated block number");
                Ok(block)
            }
        }
    }

    /// Make sure later local allocations start above `block`
    pub fn observe(&self, block: u64) {
        if let BlockAllocator::Local(next) = self {
            next.fetch_max(block + 1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryStore;

    #[tokio::test]
    async fn test_local_starts_at_one() {
        let blocks = BlockAllocator::local();
        assert_eq!(blocks.allocate("all").await.unwrap(), 1);
        assert_eq!(blocks.allocate("all").await.unwrap(), 2);
        blocks.observe(9);
        assert_eq!(blocks.allocate("all").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_coordinated_is_shared() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let a = BlockAllocator::coordinated(store.clone(), "/clickhouse/t", RetryConfig::default());
        let b = BlockAllocator::coordinated(store.clone(), "/clickhouse/t", RetryConfig::default());
        assert_eq!(a.allocate("all").await.unwrap(), 0);
        assert_eq!(b.allocate("all").await.unwrap(), 1);
        assert_eq!(a.allocate("all").await.unwrap(), 2);
        assert!(store
            .exists("/clickhouse/t/block_numbers/all")
            .await
            .unwrap());
    }
}
