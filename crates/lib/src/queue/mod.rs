//! Per-conversation message queue and its dispatch coordinator.
//!
//! `QueueContext` is the synchronous state machine for one conversation;
//! `Coordinator` owns one context per key, applies the effects of each trigger
//! (persist, broadcast, hand off to the page driver, retry timer) and serializes
//! triggers per conversation.

mod context;
mod coordinator;
mod error;
mod events;
mod id;

pub use context::{
    ContextKey, DispatchState, Effect, ItemId, QueueContext, QueueItem, QueueSnapshot,
    SubmitOutcome,
};
pub use coordinator::{ContextStatus, Coordinator, DEFAULT_RETRY_DELAY};
pub use error::QueueError;
pub use events::QueueEvent;
pub use id::generate_id;
