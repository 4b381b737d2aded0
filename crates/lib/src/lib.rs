//! chatq core library: per-conversation message queues dispatched to a page driver one
//! item at a time, with durable state and an HTTP + WebSocket gateway.

pub mod config;
pub mod driver;
pub mod gateway;
pub mod init;
pub mod queue;
pub mod store;
