//! Page driver seam: the collaborator that types and submits on the live page.
//!
//! The coordinator hands one item at a time to the driver registered for a
//! conversation. Outcomes come back later through `Coordinator::submitted` /
//! `Coordinator::failed`; the handoff itself only reports whether the driver was reached.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// "Type and submit this text now."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub context_key: String,
    pub id: String,
    pub text: String,
}

/// The page driver for a conversation could not be reached at handoff time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("page driver unreachable: {0}")]
pub struct DriverUnreachable(pub String);

/// Handle to a live page driver.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Driver id, unique per connection.
    fn id(&self) -> &str;
    /// Deliver a dispatch request. Must not wait for the submission outcome.
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), DriverUnreachable>;
}

/// Drivers by context key. Shared across the gateway.
pub struct DriverRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn PageDriver>>>>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Attach `driver` to `key`, replacing any previous driver for that key.
    pub async fn register(&self, key: impl Into<String>, driver: Arc<dyn PageDriver>) {
        let key = key.into();
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(key.clone(), driver) {
            log::debug!("driver {} replaced for {}", old.id(), key);
        }
    }

    /// Detach the driver for `key` only if it is the one with `driver_id`.
    pub async fn unregister(&self, key: &str, driver_id: &str) -> bool {
        let mut g = self.inner.write().await;
        if g.get(key).map_or(false, |d| d.id() == driver_id) {
            g.remove(key);
            true
        } else {
            false
        }
    }

    /// Detach every registration held by `driver_id`; returns the affected keys.
    pub async fn unregister_all(&self, driver_id: &str) -> Vec<String> {
        let mut g = self.inner.write().await;
        let keys: Vec<String> = g
            .iter()
            .filter(|(_, d)| d.id() == driver_id)
            .map(|(k, _)| k.clone())
            .collect();
        for k in &keys {
            g.remove(k);
        }
        keys
    }

    pub async fn get(&self, key: &str) -> Option<Arc<dyn PageDriver>> {
        self.inner.read().await.get(key).cloned()
    }

    /// Whether `driver_id` is the driver currently attached for `key`.
    pub async fn is_attached(&self, key: &str, driver_id: &str) -> bool {
        self.inner
            .read()
            .await
            .get(key)
            .map_or(false, |d| d.id() == driver_id)
    }

    /// Hand `request` to the driver for its context key.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<(), DriverUnreachable> {
        let Some(driver) = self.get(&request.context_key).await else {
            return Err(DriverUnreachable(format!(
                "no driver attached for {}",
                request.context_key
            )));
        };
        driver.dispatch(request).await
    }
}
