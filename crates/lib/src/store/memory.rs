//! In-process store; contents are lost when the process exits.

use crate::queue::QueueSnapshot;
use crate::store::{QueueStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryQueueStore {
    inner: RwLock<HashMap<String, QueueSnapshot>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self, key: &str) -> Result<Option<QueueSnapshot>, StoreError> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, snapshot: &QueueSnapshot) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .insert(key.to_string(), snapshot.clone());
        Ok(())
    }
}
