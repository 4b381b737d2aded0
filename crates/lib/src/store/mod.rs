//! Durable storage for queue snapshots, keyed by conversation.
//!
//! Only `{items, paused}` is stored. The coordinator writes through `persist`, which
//! retries a failed write a few times and then gives up with a warning; write
//! failures never reach the trigger that caused them. A failed load is retried by
//! the coordinator on the next trigger.

mod file;
mod memory;

pub use file::FileQueueStore;
pub use memory::MemoryQueueStore;

use crate::queue::QueueSnapshot;
use async_trait::async_trait;
use std::time::Duration;

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("state directory {0} is locked by another process")]
    Locked(String),
}

/// Key-value store of queue snapshots.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Load the snapshot for `key`. `Ok(None)` when nothing was stored.
    async fn load(&self, key: &str) -> Result<Option<QueueSnapshot>, StoreError>;

    /// Replace the snapshot for `key`.
    async fn save(&self, key: &str, snapshot: &QueueSnapshot) -> Result<(), StoreError>;
}

/// Write `snapshot` with bounded retries. Errors are logged, never returned.
pub async fn persist(store: &dyn QueueStore, key: &str, snapshot: &QueueSnapshot) {
    for attempt in 1..=PERSIST_ATTEMPTS {
        match store.save(key, snapshot).await {
            Ok(()) => return,
            Err(e) if attempt < PERSIST_ATTEMPTS => {
                log::debug!("persist {} attempt {} failed: {}", key, attempt, e);
                tokio::time::sleep(PERSIST_BACKOFF * attempt).await;
            }
            Err(e) => {
                log::warn!("persist {} failed after {} attempts: {}", key, attempt, e);
            }
        }
    }
}
