//! Gateway: HTTP + WebSocket control plane for the queue coordinator.
//!
//! Single port serves HTTP and WebSocket. Protocol: first request must be `connect`;
//! then controller requests (`queue.*`), page driver reports (`driver.*`) and events.

mod protocol;
mod server;

pub use protocol::{
    ConnectParams, ContextParams, EditParams, EnqueueParams, HelloOk, ItemParams,
    PageStateParams, WsRequest, WsResponse,
};
pub use server::{run_gateway, serve};
