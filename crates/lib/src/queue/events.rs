//! Observer notifications for queue state changes.

use crate::queue::context::QueueSnapshot;
use serde::Serialize;

/// Sent to observers after a mutation or a reported dispatch failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum QueueEvent {
    /// Current `{items, paused}` for a conversation.
    #[serde(rename_all = "camelCase")]
    State {
        context_key: String,
        #[serde(flatten)]
        snapshot: QueueSnapshot,
    },
    /// The page driver reported a failure; the item is still queued.
    #[serde(rename_all = "camelCase")]
    Warning { context_key: String, message: String },
}

impl QueueEvent {
    pub fn context_key(&self) -> &str {
        match self {
            QueueEvent::State { context_key, .. } => context_key,
            QueueEvent::Warning { context_key, .. } => context_key,
        }
    }

    /// Event name on the gateway wire.
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::State { .. } => "queue.state",
            QueueEvent::Warning { .. } => "queue.warning",
        }
    }
}
