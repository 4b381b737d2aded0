//! Dispatch coordinator: one queue context per conversation key.
//!
//! Every trigger locks the conversation's record, runs the state-machine transition,
//! then applies the returned effects while still holding the lock. That keeps triggers
//! for one conversation strictly ordered (including their storage writes) while
//! different conversations proceed independently.

use crate::driver::{DispatchRequest, DriverRegistry};
use crate::queue::context::{
    ContextKey, DispatchState, Effect, ItemId, QueueContext, QueueItem, QueueSnapshot,
    SubmitOutcome,
};
use crate::queue::error::QueueError;
use crate::queue::events::QueueEvent;
use crate::store::{self, QueueStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;

/// Delay before re-evaluating dispatch after the page driver reports an error.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(300);

const EVENT_CAPACITY: usize = 256;

/// Diagnostic view of a context, including the transient flags.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStatus {
    pub items: Vec<QueueItem>,
    pub paused: bool,
    pub page_busy: bool,
    pub dispatching: bool,
    pub in_flight: Option<ItemId>,
    pub state: DispatchState,
}

/// Lockable record for one conversation.
#[derive(Default)]
struct ContextRecord {
    ctx: QueueContext,
    loaded: bool,
    /// Pending single-shot retry after a reported dispatch error.
    retry: Option<JoinHandle<()>>,
}

struct Inner {
    contexts: RwLock<HashMap<ContextKey, Arc<Mutex<ContextRecord>>>>,
    store: Arc<dyn QueueStore>,
    drivers: Arc<DriverRegistry>,
    events: broadcast::Sender<QueueEvent>,
    retry_delay: Duration,
}

/// Owns all conversation queues. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn QueueStore>,
        drivers: Arc<DriverRegistry>,
        retry_delay: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                contexts: RwLock::new(HashMap::new()),
                store,
                drivers,
                events,
                retry_delay,
            }),
        }
    }

    /// Receive state and warning events for all conversations.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.inner.drivers
    }

    pub fn retry_delay(&self) -> Duration {
        self.inner.retry_delay
    }

    /// Keys of conversations referenced since start-up.
    pub async fn contexts(&self) -> Vec<ContextKey> {
        let mut keys: Vec<ContextKey> = self.inner.contexts.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Append `text` to the queue; dispatches immediately if the conversation is eligible.
    pub async fn enqueue(&self, key: &str, text: &str) -> Result<ItemId, QueueError> {
        let mut record = self.lock_loaded(key).await?;
        let (id, effects) = record.ctx.enqueue(text)?;
        log::debug!("{}: enqueued {}", key, id);
        self.apply(key, &mut record, effects).await;
        Ok(id)
    }

    pub async fn remove(&self, key: &str, id: &str) -> Result<(), QueueError> {
        let mut record = self.lock_loaded(key).await?;
        let effects = record.ctx.remove(id)?;
        log::debug!("{}: removed {}", key, id);
        self.apply(key, &mut record, effects).await;
        Ok(())
    }

    pub async fn edit(&self, key: &str, id: &str, text: &str) -> Result<(), QueueError> {
        let mut record = self.lock_loaded(key).await?;
        let effects = record.ctx.edit(id, text)?;
        log::debug!("{}: edited {}", key, id);
        self.apply(key, &mut record, effects).await;
        Ok(())
    }

    pub async fn clear(&self, key: &str) -> Result<(), QueueError> {
        let mut record = self.lock_loaded(key).await?;
        let effects = record.ctx.clear();
        log::debug!("{}: cleared", key);
        self.apply(key, &mut record, effects).await;
        Ok(())
    }

    pub async fn pause(&self, key: &str) -> Result<(), QueueError> {
        self.set_paused(key, true).await
    }

    pub async fn resume(&self, key: &str) -> Result<(), QueueError> {
        self.set_paused(key, false).await
    }

    pub async fn get_state(&self, key: &str) -> Result<QueueSnapshot, QueueError> {
        Ok(self.lock_loaded(key).await?.ctx.snapshot())
    }

    pub async fn status(&self, key: &str) -> Result<ContextStatus, QueueError> {
        let record = self.lock_loaded(key).await?;
        let ctx = &record.ctx;
        Ok(ContextStatus {
            items: ctx.items().to_vec(),
            paused: ctx.is_paused(),
            page_busy: ctx.is_page_busy(),
            dispatching: ctx.is_dispatching(),
            in_flight: ctx.in_flight().map(str::to_string),
            state: ctx.state(),
        })
    }

    /// Busy/idle observation from the page driver.
    pub async fn page_state(&self, key: &str, busy: bool) {
        let mut record = self.lock(key).await;
        let effects = record.ctx.page_state(busy);
        self.apply(key, &mut record, effects).await;
    }

    /// The page driver typed and submitted item `id`.
    pub async fn submitted(&self, key: &str, id: &str) -> SubmitOutcome {
        let mut record = self.lock(key).await;
        let (outcome, effects) = record.ctx.submitted(id);
        match outcome {
            SubmitOutcome::Advanced => log::debug!("{}: submitted {}", key, id),
            SubmitOutcome::Desync => log::warn!(
                "{}: submitted {} no longer at head, queue left unchanged",
                key,
                id
            ),
        }
        self.apply(key, &mut record, effects).await;
        outcome
    }

    /// The page driver could not complete the dispatch of `id` (the in-flight item when
    /// `None`). The item stays at the head.
    pub async fn failed(&self, key: &str, id: Option<&str>, message: &str) {
        let mut record = self.lock(key).await;
        let effects = record.ctx.failed(id, message);
        if effects.is_empty() {
            log::warn!("{}: ignoring stale dispatch error for {:?}: {}", key, id, message);
        } else {
            log::info!("{}: dispatch failed: {}", key, message);
        }
        self.apply(key, &mut record, effects).await;
    }

    /// The page driver for `key` detached; any in-flight item becomes eligible again
    /// once a new driver attaches.
    pub async fn driver_gone(&self, key: &str) {
        let mut record = self.lock(key).await;
        if record.ctx.is_dispatching() {
            log::info!("{}: driver detached with an item in flight", key);
        }
        record.ctx.driver_gone();
    }

    /// Re-check eligibility and dispatch the head if possible.
    pub async fn evaluate(&self, key: &str) {
        let mut record = self.lock(key).await;
        let effects: Vec<Effect> = record.ctx.evaluate().into_iter().collect();
        self.apply(key, &mut record, effects).await;
    }

    async fn set_paused(&self, key: &str, paused: bool) -> Result<(), QueueError> {
        let mut record = self.lock_loaded(key).await?;
        let effects = record.ctx.set_paused(paused);
        log::debug!("{}: paused={}", key, paused);
        self.apply(key, &mut record, effects).await;
        Ok(())
    }

    /// Like `lock`, but refuses to hand out a record whose stored state could not be read.
    async fn lock_loaded(&self, key: &str) -> Result<OwnedMutexGuard<ContextRecord>, QueueError> {
        let record = self.lock(key).await;
        if !record.loaded {
            return Err(QueueError::StorageUnavailable(key.to_string()));
        }
        Ok(record)
    }

    /// Lock the record for `key`, creating it on first reference and loading its stored
    /// state until a load succeeds.
    async fn lock(&self, key: &str) -> OwnedMutexGuard<ContextRecord> {
        let existing = self.inner.contexts.read().await.get(key).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => self
                .inner
                .contexts
                .write()
                .await
                .entry(key.to_string())
                .or_default()
                .clone(),
        };
        let mut record = slot.lock_owned().await;
        if !record.loaded {
            match self.inner.store.load(key).await {
                Ok(Some(snapshot)) => {
                    log::debug!("{}: restored {} item(s)", key, snapshot.items.len());
                    record.ctx.restore(snapshot);
                    record.loaded = true;
                }
                Ok(None) => record.loaded = true,
                Err(e) => log::warn!("{}: loading queue state failed, will retry: {}", key, e),
            }
        }
        record
    }

    async fn apply(&self, key: &str, record: &mut ContextRecord, effects: Vec<Effect>) {
        for effect in effects {
            // Until stored state is loaded, the in-memory context must not replace it.
            if !record.loaded && matches!(effect, Effect::Persist | Effect::Broadcast) {
                continue;
            }
            match effect {
                Effect::Persist => {
                    let snapshot = record.ctx.snapshot();
                    store::persist(self.inner.store.as_ref(), key, &snapshot).await;
                }
                Effect::Broadcast => self.broadcast(QueueEvent::State {
                    context_key: key.to_string(),
                    snapshot: record.ctx.snapshot(),
                }),
                Effect::Warn(message) => self.broadcast(QueueEvent::Warning {
                    context_key: key.to_string(),
                    message,
                }),
                Effect::Dispatch(item) => self.hand_off(key, record, item).await,
                Effect::ArmRetry => self.arm_retry(key, record),
            }
        }
    }

    async fn hand_off(&self, key: &str, record: &mut ContextRecord, item: QueueItem) {
        let request = DispatchRequest {
            context_key: key.to_string(),
            id: item.id.clone(),
            text: item.text,
        };
        match self.inner.drivers.dispatch(request).await {
            Ok(()) => log::debug!("{}: dispatched {}", key, item.id),
            Err(e) => {
                log::debug!("{}: {}; {} stays queued", key, e, item.id);
                record.ctx.handoff_failed(&item.id);
            }
        }
    }

    /// Observers may be gone; delivery failures are ignored.
    fn broadcast(&self, event: QueueEvent) {
        let _ = self.inner.events.send(event);
    }

    fn arm_retry(&self, key: &str, record: &mut ContextRecord) {
        if let Some(pending) = record.retry.take() {
            pending.abort();
        }
        let coordinator = self.clone();
        let key = key.to_string();
        let delay = self.inner.retry_delay;
        record.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            coordinator.fire_retry(&key).await;
        }));
    }

    async fn fire_retry(&self, key: &str) {
        let mut record = self.lock(key).await;
        // Detach our own handle; aborting it here would cancel this task.
        record.retry.take();
        let effects: Vec<Effect> = record.ctx.evaluate().into_iter().collect();
        if effects.is_empty() {
            log::debug!("{}: retry found nothing eligible", key);
        }
        self.apply(key, &mut record, effects).await;
    }
}
