//! Per-conversation queue state machine.
//!
//! A `QueueContext` owns the ordered items for one conversation plus the transient
//! page/dispatch flags. Trigger methods mutate the context and return the effects the
//! caller must carry out (persist, broadcast, hand an item to the page driver, arm the
//! retry timer). Nothing here does I/O, so every transition can be tested synchronously.

use crate::queue::error::QueueError;
use crate::queue::id::generate_id;
use serde::{Deserialize, Serialize};

/// Opaque conversation identity (e.g. a browser tab id).
pub type ContextKey = String;

/// Opaque item identifier, stable for the item's lifetime.
pub type ItemId = String;

/// One queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub text: String,
}

/// The durable part of a context: what is persisted, reloaded and broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub items: Vec<QueueItem>,
    #[serde(default)]
    pub paused: bool,
}

/// Derived dispatch state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchState {
    /// Nothing to do: empty, paused, or page busy.
    Idle,
    /// Head item may be handed to the page driver now.
    Eligible,
    /// One item handed off; waiting for submitted/error.
    Dispatching,
}

/// Side effect requested by a transition, applied by the coordinator in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Write the current snapshot to durable storage.
    Persist,
    /// Send the current snapshot to observers.
    Broadcast,
    /// Surface a dispatch failure to observers.
    Warn(String),
    /// Hand this item to the page driver. The context is already marked in flight.
    Dispatch(QueueItem),
    /// Schedule one delayed re-evaluation of dispatch eligibility.
    ArmRetry,
}

/// Result of a `submitted` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Head matched and was removed.
    Advanced,
    /// Head no longer matches the reported id; items untouched.
    Desync,
}

/// Queue state for one conversation.
#[derive(Debug, Default)]
pub struct QueueContext {
    items: Vec<QueueItem>,
    paused: bool,
    page_busy: bool,
    in_flight: Option<ItemId>,
}

impl QueueContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted snapshot. Page and dispatch flags always start cleared.
    pub fn from_snapshot(snapshot: QueueSnapshot) -> Self {
        Self {
            items: snapshot.items,
            paused: snapshot.paused,
            page_busy: false,
            in_flight: None,
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            items: self.items.clone(),
            paused: self.paused,
        }
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_page_busy(&self) -> bool {
        self.page_busy
    }

    pub fn is_dispatching(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Id handed to the page driver and not yet reconciled.
    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_deref()
    }

    pub fn state(&self) -> DispatchState {
        if self.in_flight.is_some() {
            DispatchState::Dispatching
        } else if self.items.is_empty() || self.paused || self.page_busy {
            DispatchState::Idle
        } else {
            DispatchState::Eligible
        }
    }

    /// Append trimmed text with a fresh id. Returns the id and the effects to apply.
    pub fn enqueue(&mut self, text: &str) -> Result<(ItemId, Vec<Effect>), QueueError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QueueError::EmptyText);
        }
        let id = self.fresh_id()?;
        self.items.push(QueueItem {
            id: id.clone(),
            text: text.to_string(),
        });
        let mut effects = vec![Effect::Persist, Effect::Broadcast];
        effects.extend(self.evaluate());
        Ok((id, effects))
    }

    /// Remove the item with `id` wherever it is, including the in-flight head.
    pub fn remove(&mut self, id: &str) -> Result<Vec<Effect>, QueueError> {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        if self.items.len() == before {
            return Err(QueueError::NotFound(id.to_string()));
        }
        self.drop_in_flight_if_empty();
        Ok(vec![Effect::Persist, Effect::Broadcast])
    }

    /// Replace the text of the item with `id`; position and id are kept.
    pub fn edit(&mut self, id: &str, text: &str) -> Result<Vec<Effect>, QueueError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QueueError::EmptyText);
        }
        let item = self
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        item.text = text.to_string();
        Ok(vec![Effect::Persist, Effect::Broadcast])
    }

    pub fn clear(&mut self) -> Vec<Effect> {
        self.items.clear();
        self.drop_in_flight_if_empty();
        vec![Effect::Persist, Effect::Broadcast]
    }

    /// Pause or resume. Resuming re-evaluates dispatch.
    pub fn set_paused(&mut self, paused: bool) -> Vec<Effect> {
        self.paused = paused;
        let mut effects = vec![Effect::Persist, Effect::Broadcast];
        if !paused {
            effects.extend(self.evaluate());
        }
        effects
    }

    /// Record the page's busy signal. Only a busy -> idle edge re-evaluates dispatch.
    pub fn page_state(&mut self, busy: bool) -> Vec<Effect> {
        let was_busy = self.page_busy;
        self.page_busy = busy;
        if was_busy && !busy {
            self.evaluate().into_iter().collect()
        } else {
            Vec::new()
        }
    }

    /// If eligible, mark the head in flight and return the dispatch effect for it.
    pub fn evaluate(&mut self) -> Option<Effect> {
        if self.state() != DispatchState::Eligible {
            return None;
        }
        let head = self.items.first()?.clone();
        self.in_flight = Some(head.id.clone());
        Some(Effect::Dispatch(head))
    }

    /// The page driver could not be reached for `id`. Items stay as they are.
    pub fn handoff_failed(&mut self, id: &str) {
        self.settle(id);
    }

    /// The page driver went away with an item in flight. Items stay as they are.
    pub fn driver_gone(&mut self) {
        self.in_flight = None;
    }

    /// Replace the durable part with a snapshot loaded after the context was created.
    /// Page state observed meanwhile is kept.
    pub fn restore(&mut self, snapshot: QueueSnapshot) {
        self.items = snapshot.items;
        self.paused = snapshot.paused;
        self.in_flight = None;
    }

    /// The page driver submitted `id`. Pops the head only if it is still that item.
    /// An outcome for an older handoff leaves a newer in-flight item alone.
    /// Never re-evaluates: the page is expected to turn busy with the response.
    pub fn submitted(&mut self, id: &str) -> (SubmitOutcome, Vec<Effect>) {
        self.settle(id);
        match self.items.first() {
            Some(head) if head.id == id => {
                self.items.remove(0);
                (
                    SubmitOutcome::Advanced,
                    vec![Effect::Persist, Effect::Broadcast],
                )
            }
            _ => (SubmitOutcome::Desync, Vec::new()),
        }
    }

    /// The page driver reported a failure. The head stays queued and one retry is armed.
    /// A failure reported for an item other than the in-flight one is stale and ignored.
    pub fn failed(&mut self, id: Option<&str>, message: &str) -> Vec<Effect> {
        match id {
            Some(id) if self.in_flight.as_deref() != Some(id) => return Vec::new(),
            _ => self.in_flight = None,
        }
        vec![
            Effect::Broadcast,
            Effect::Warn(message.to_string()),
            Effect::ArmRetry,
        ]
    }

    /// Clear the in-flight marker if it belongs to `id`.
    fn settle(&mut self, id: &str) {
        if self.in_flight.as_deref() == Some(id) {
            self.in_flight = None;
        }
    }

    fn drop_in_flight_if_empty(&mut self) {
        if self.items.is_empty() {
            self.in_flight = None;
        }
    }

    fn fresh_id(&self) -> Result<ItemId, QueueError> {
        loop {
            let id = generate_id()?;
            if !self.items.iter().any(|item| item.id == id) {
                return Ok(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatched(effects: &[Effect]) -> Option<&QueueItem> {
        effects.iter().find_map(|e| match e {
            Effect::Dispatch(item) => Some(item),
            _ => None,
        })
    }

    fn texts(ctx: &QueueContext) -> Vec<&str> {
        ctx.items().iter().map(|i| i.text.as_str()).collect()
    }

    fn assert_invariant(ctx: &QueueContext) {
        if ctx.is_dispatching() {
            assert!(!ctx.items().is_empty());
        }
    }

    #[test]
    fn enqueue_trims_and_dispatches_head_when_eligible() {
        let mut ctx = QueueContext::new();
        let (a, effects) = ctx.enqueue("  a \n").unwrap();
        assert_eq!(effects[..2], [Effect::Persist, Effect::Broadcast]);
        let item = dispatched(&effects).unwrap();
        assert_eq!(item.id, a);
        assert_eq!(item.text, "a");
        assert_eq!(ctx.state(), DispatchState::Dispatching);

        let (_, effects) = ctx.enqueue("b").unwrap();
        assert!(dispatched(&effects).is_none());
        assert_eq!(texts(&ctx), ["a", "b"]);
        assert_eq!(ctx.in_flight(), Some(a.as_str()));
    }

    #[test]
    fn enqueue_rejects_blank_text() {
        let mut ctx = QueueContext::new();
        assert_eq!(ctx.enqueue("   ").unwrap_err(), QueueError::EmptyText);
        assert!(ctx.items().is_empty());
    }

    #[test]
    fn submitted_then_idle_dispatches_next() {
        let mut ctx = QueueContext::new();
        let (a, _) = ctx.enqueue("a").unwrap();
        let (b, _) = ctx.enqueue("b").unwrap();

        assert!(ctx.page_state(true).is_empty());
        let (outcome, effects) = ctx.submitted(&a);
        assert_eq!(outcome, SubmitOutcome::Advanced);
        assert!(dispatched(&effects).is_none());
        assert_eq!(texts(&ctx), ["b"]);
        assert!(!ctx.is_dispatching());

        let effects = ctx.page_state(false);
        assert_eq!(dispatched(&effects).map(|i| i.id.as_str()), Some(b.as_str()));
    }

    #[test]
    fn submitted_does_not_reevaluate_even_if_idle() {
        let mut ctx = QueueContext::new();
        let (a, _) = ctx.enqueue("a").unwrap();
        ctx.enqueue("b").unwrap();
        let (_, effects) = ctx.submitted(&a);
        assert!(dispatched(&effects).is_none());
        assert_eq!(ctx.state(), DispatchState::Eligible);
    }

    #[test]
    fn only_busy_to_idle_edge_dispatches() {
        let mut ctx = QueueContext::new();
        ctx.page_state(true);
        ctx.enqueue("a").unwrap();
        assert!(ctx.page_state(true).is_empty());
        assert!(!ctx.is_dispatching());
        assert!(dispatched(&ctx.page_state(false)).is_some());

        let mut idle = QueueContext::from_snapshot(QueueSnapshot {
            items: vec![QueueItem {
                id: "x".into(),
                text: "x".into(),
            }],
            paused: false,
        });
        // idle -> idle is not an edge
        assert!(idle.page_state(false).is_empty());
        assert_eq!(idle.state(), DispatchState::Eligible);
    }

    #[test]
    fn pause_blocks_dispatch_until_resume() {
        let mut ctx = QueueContext::new();
        ctx.page_state(true);
        let (x, _) = ctx.enqueue("x").unwrap();
        let effects = ctx.set_paused(true);
        assert_eq!(effects, [Effect::Persist, Effect::Broadcast]);
        assert!(ctx.page_state(false).is_empty());
        assert!(!ctx.is_dispatching());

        let effects = ctx.set_paused(false);
        assert_eq!(dispatched(&effects).map(|i| i.id.as_str()), Some(x.as_str()));
    }

    #[test]
    fn error_keeps_item_and_arms_retry() {
        let mut ctx = QueueContext::new();
        let (x, _) = ctx.enqueue("x").unwrap();
        let effects = ctx.failed(None, "boom");
        assert_eq!(
            effects,
            [
                Effect::Broadcast,
                Effect::Warn("boom".into()),
                Effect::ArmRetry
            ]
        );
        assert_eq!(ctx.items()[0].id, x);
        assert!(!ctx.is_dispatching());
        assert_eq!(
            ctx.evaluate().and_then(|e| match e {
                Effect::Dispatch(item) => Some(item.id),
                _ => None,
            }),
            Some(x)
        );
    }

    #[test]
    fn handoff_failure_clears_in_flight_without_touching_items() {
        let mut ctx = QueueContext::new();
        let (x, _) = ctx.enqueue("x").unwrap();
        ctx.handoff_failed(&x);
        assert!(!ctx.is_dispatching());
        assert_eq!(ctx.items().len(), 1);
        assert_eq!(ctx.state(), DispatchState::Eligible);
    }

    #[test]
    fn driver_gone_releases_in_flight_item() {
        let mut ctx = QueueContext::new();
        let (x, _) = ctx.enqueue("x").unwrap();
        ctx.driver_gone();
        assert_eq!(ctx.state(), DispatchState::Eligible);
        assert_eq!(ctx.items()[0].id, x);
    }

    #[test]
    fn desync_never_drops_another_item() {
        let mut ctx = QueueContext::new();
        let (a, _) = ctx.enqueue("a").unwrap();
        ctx.enqueue("b").unwrap();
        ctx.remove(&a).unwrap();
        assert!(ctx.is_dispatching());
        assert_invariant(&ctx);

        let (outcome, effects) = ctx.submitted(&a);
        assert_eq!(outcome, SubmitOutcome::Desync);
        assert!(effects.is_empty());
        assert_eq!(texts(&ctx), ["b"]);
        assert!(!ctx.is_dispatching());
    }

    #[test]
    fn clearing_under_dispatch_keeps_invariant() {
        let mut ctx = QueueContext::new();
        let (a, _) = ctx.enqueue("a").unwrap();
        ctx.clear();
        assert!(!ctx.is_dispatching());
        assert_invariant(&ctx);
        let (outcome, _) = ctx.submitted(&a);
        assert_eq!(outcome, SubmitOutcome::Desync);
    }

    #[test]
    fn stale_outcome_after_clear_keeps_newer_dispatch() {
        let mut ctx = QueueContext::new();
        let (a, _) = ctx.enqueue("a").unwrap();
        ctx.clear();
        let (c, effects) = ctx.enqueue("c").unwrap();
        assert_eq!(dispatched(&effects).map(|i| i.id.as_str()), Some(c.as_str()));

        ctx.page_state(true);
        let (outcome, effects) = ctx.submitted(&a);
        assert_eq!(outcome, SubmitOutcome::Desync);
        assert!(effects.is_empty());
        assert_eq!(ctx.in_flight(), Some(c.as_str()));

        assert!(dispatched(&ctx.page_state(false)).is_none());
        assert_eq!(ctx.submitted(&c).0, SubmitOutcome::Advanced);
        assert!(ctx.items().is_empty());
    }

    #[test]
    fn stale_error_leaves_newer_dispatch_alone() {
        let mut ctx = QueueContext::new();
        let (a, _) = ctx.enqueue("a").unwrap();
        ctx.clear();
        let (c, _) = ctx.enqueue("c").unwrap();

        assert!(ctx.failed(Some(&a), "late").is_empty());
        assert_eq!(ctx.in_flight(), Some(c.as_str()));

        let effects = ctx.failed(Some(&c), "boom");
        assert!(effects.contains(&Effect::ArmRetry));
        assert!(!ctx.is_dispatching());
    }

    #[test]
    fn restore_replaces_items_and_keeps_page_state() {
        let mut ctx = QueueContext::new();
        ctx.page_state(true);
        ctx.restore(QueueSnapshot {
            items: vec![QueueItem {
                id: "old".into(),
                text: "keep me".into(),
            }],
            paused: true,
        });
        assert_eq!(texts(&ctx), ["keep me"]);
        assert!(ctx.is_paused());
        assert!(ctx.is_page_busy());
    }

    #[test]
    fn remove_missing_is_not_found_and_mutates_nothing() {
        let mut ctx = QueueContext::new();
        ctx.page_state(true);
        ctx.enqueue("a").unwrap();
        let before = ctx.snapshot();
        assert_eq!(
            ctx.remove("nope").unwrap_err(),
            QueueError::NotFound("nope".into())
        );
        assert_eq!(ctx.snapshot(), before);
    }

    #[test]
    fn edit_keeps_position_and_id() {
        let mut ctx = QueueContext::new();
        ctx.page_state(true);
        ctx.enqueue("a").unwrap();
        let (b, _) = ctx.enqueue("b").unwrap();
        ctx.enqueue("c").unwrap();
        ctx.edit(&b, " B ").unwrap();
        assert_eq!(texts(&ctx), ["a", "B", "c"]);
        assert_eq!(ctx.items()[1].id, b);
        assert!(matches!(
            ctx.edit("missing", "z"),
            Err(QueueError::NotFound(_))
        ));
        assert_eq!(ctx.edit(&b, "  "), Err(QueueError::EmptyText));
    }

    #[test]
    fn fifo_survives_interleaved_non_head_changes() {
        let mut ctx = QueueContext::new();
        ctx.page_state(true);
        let mut ids = Vec::new();
        for t in ["1", "2", "3", "4", "5"] {
            ids.push(ctx.enqueue(t).unwrap().0);
        }
        ctx.remove(&ids[2]).unwrap();
        ctx.edit(&ids[3], "four").unwrap();
        ctx.enqueue("6").unwrap();
        assert_eq!(texts(&ctx), ["1", "2", "four", "5", "6"]);
    }

    #[test]
    fn snapshot_reload_resets_transient_flags() {
        let mut ctx = QueueContext::new();
        ctx.enqueue("a").unwrap();
        ctx.enqueue("b").unwrap();
        ctx.page_state(true);
        ctx.set_paused(true);
        assert!(ctx.is_dispatching());

        let reloaded = QueueContext::from_snapshot(ctx.snapshot());
        assert_eq!(reloaded.items(), ctx.items());
        assert!(reloaded.is_paused());
        assert!(!reloaded.is_dispatching());
        assert!(!reloaded.is_page_busy());
    }
}
