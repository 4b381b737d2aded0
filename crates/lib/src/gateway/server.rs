//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::driver::{DispatchRequest, DriverRegistry, DriverUnreachable, PageDriver};
use crate::gateway::protocol::{
    event_frame, ConnectParams, ContextParams, DriverErrorParams, EditParams, EnqueueParams,
    HelloOk, HelloPolicy, ItemParams, PageStateParams, WsRequest, WsResponse,
};
use crate::init;
use crate::queue::{Coordinator, QueueEvent, SubmitOutcome};
use crate::store::{FileQueueStore, QueueStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const PROTOCOL_VERSION: u32 = 1;

const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"event","event":"shutdown","payload":{}}"#;

/// When auth mode is token and a token is configured, returns it for connect validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Shared state for the gateway (config, coordinator, shutdown events).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, WebSocket connect must provide params.auth.token matching this.
    pub required_token: Option<String>,
    /// Broadcasts gateway-wide events to connected clients (e.g. shutdown).
    pub event_tx: broadcast::Sender<String>,
    pub coordinator: Coordinator,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Page driver backed by a WebSocket connection: dispatches become `queue.dispatch` event frames.
struct SocketDriver {
    id: String,
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl PageDriver for SocketDriver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn dispatch(&self, request: DispatchRequest) -> Result<(), DriverUnreachable> {
        let payload = serde_json::to_value(&request).unwrap_or_default();
        self.tx
            .send(event_frame("queue.dispatch", payload))
            .map_err(|_| DriverUnreachable(format!("connection {} closed", self.id)))
    }
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a gateway token must be configured or startup fails.
/// Requires the configuration directory to be initialized (`chatq init`).
/// Queue state is stored under the resolved state directory.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    let state_dir = config::resolve_state_dir(&config, &config_path);
    let store = FileQueueStore::open(&state_dir)
        .with_context(|| format!("opening state directory {}", state_dir.display()))?;
    log::info!("queue state directory: {}", store.dir().display());
    serve(config, Arc::new(store)).await
}

/// Run the gateway with an explicit queue store. Blocks until shutdown (e.g. Ctrl+C).
pub async fn serve(config: Config, store: Arc<dyn QueueStore>) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or CHATQ_GATEWAY_TOKEN)",
                bind
            );
        }
    }

    let required_token = require_connect_token(&config);
    let (event_tx, _) = broadcast::channel(64);
    let coordinator = Coordinator::new(
        store,
        Arc::new(DriverRegistry::new()),
        config.queue.retry_delay(),
    );

    let state = GatewayState {
        config: Arc::new(config.clone()),
        required_token,
        event_tx: event_tx.clone(),
        coordinator,
        started_at: chrono::Utc::now(),
    };

    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx))
        .await
        .context("gateway server exited")?;

    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event to WebSocket clients.
async fn shutdown_signal(event_tx: broadcast::Sender<String>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("shutdown signal received, broadcasting shutdown and draining connections");
    let _ = event_tx.send(SHUTDOWN_EVENT_JSON.to_string());
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
    }))
}

/// GET /ws upgrades to WebSocket. First request must be connect; we reply with hello-ok.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection state: identity, queue subscriptions, and the outbound frame channel
/// that attached page drivers write dispatches into.
struct Connection {
    id: String,
    connected: bool,
    subscriptions: HashSet<String>,
    out_tx: mpsc::UnboundedSender<String>,
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let mut conn = Connection {
        id: uuid::Uuid::new_v4().to_string(),
        connected: false,
        subscriptions: HashSet::new(),
        out_tx,
    };
    let mut event_rx = state.event_tx.subscribe();
    let mut queue_rx = state.coordinator.subscribe();

    loop {
        tokio::select! {
            biased;
            event = event_rx.recv() => {
                match event {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                        let _ = socket.send(Message::Text(text)).await;
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} gateway events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            frame = out_rx.recv() => {
                // conn holds a sender, so the channel never closes while the loop runs
                let Some(frame) = frame else { continue };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            event = queue_rx.recv() => {
                match event {
                    Ok(event) => {
                        if !conn.subscriptions.contains(event.context_key()) {
                            continue;
                        }
                        let _ = socket.send(Message::Text(queue_event_frame(&event))).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client {} lagged {} queue events", conn.id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(req): Result<WsRequest, _> = serde_json::from_str(&text) else { continue };
                if req.typ != "req" {
                    continue;
                }
                let res = handle_request(&state, &mut conn, req).await;
                let _ = socket.send(Message::Text(res.to_text())).await;
            }
        }
    }

    let detached = state.coordinator.drivers().unregister_all(&conn.id).await;
    if !detached.is_empty() {
        log::info!("connection {} closed, detached driver for {:?}", conn.id, detached);
    }
    for key in detached {
        state.coordinator.driver_gone(&key).await;
    }
    if !conn.connected {
        log::debug!("ws client disconnected before sending connect");
    }
}

/// Queue events as wire frames: `queue.state` carries `{contextKey, items, paused}`.
fn queue_event_frame(event: &QueueEvent) -> String {
    let mut payload = serde_json::to_value(event).unwrap_or_default();
    if let Some(obj) = payload.as_object_mut() {
        obj.remove("kind");
    }
    event_frame(event.name(), payload)
}

fn parse_params<T: DeserializeOwned>(req: &WsRequest, method: &str) -> Result<T, WsResponse> {
    serde_json::from_value(req.params.clone())
        .map_err(|_| WsResponse::err(&req.id, format!("invalid {} params", method)))
}

fn acknowledge(id: &str, result: Result<(), crate::queue::QueueError>) -> WsResponse {
    match result {
        Ok(()) => WsResponse::ok(id, json!({})),
        Err(e) => WsResponse::err(id, e.to_string()),
    }
}

/// Page outcomes are accepted only from the connection attached as the key's driver.
async fn require_driver(
    state: &GatewayState,
    conn: &Connection,
    id: &str,
    key: &str,
) -> Result<(), WsResponse> {
    if state.coordinator.drivers().is_attached(key, &conn.id).await {
        Ok(())
    } else {
        Err(WsResponse::err(id, "not attached as driver"))
    }
}

/// Validate connect params against the configured token and build hello-ok.
fn connect(state: &GatewayState, conn: &Connection, req: &WsRequest) -> WsResponse {
    let params: ConnectParams = match parse_params(req, "connect") {
        Ok(p) => p,
        Err(res) => return res,
    };
    if let Some(ref required) = state.required_token {
        let provided = params.auth.token.as_deref().unwrap_or("").trim();
        if provided.is_empty() {
            return WsResponse::err(
                &req.id,
                "unauthorized: gateway token missing (set CHATQ_GATEWAY_TOKEN or gateway.auth.token)",
            );
        }
        if provided != required {
            return WsResponse::err(&req.id, "unauthorized: gateway token mismatch");
        }
    }
    let protocol = params
        .max_protocol
        .unwrap_or(PROTOCOL_VERSION)
        .min(PROTOCOL_VERSION);
    let hello = HelloOk {
        typ: "hello-ok".to_string(),
        protocol,
        conn_id: conn.id.clone(),
        policy: Some(HelloPolicy {
            retry_delay_ms: Some(state.coordinator.retry_delay().as_millis() as u64),
        }),
    };
    log::debug!(
        "connection {} connected (client {:?}, role {:?})",
        conn.id,
        params.client.id,
        params.role
    );
    WsResponse::ok(&req.id, serde_json::to_value(&hello).unwrap_or(json!({})))
}

async fn handle_request(state: &GatewayState, conn: &mut Connection, req: WsRequest) -> WsResponse {
    if req.method == "connect" {
        let res = connect(state, conn, &req);
        if res.ok {
            conn.connected = true;
        }
        return res;
    }
    if !conn.connected {
        return WsResponse::err(&req.id, "connect required");
    }
    match dispatch_method(state, conn, &req).await {
        Ok(res) | Err(res) => res,
    }
}

async fn dispatch_method(
    state: &GatewayState,
    conn: &mut Connection,
    req: &WsRequest,
) -> Result<WsResponse, WsResponse> {
    let coordinator = &state.coordinator;
    let id = req.id.as_str();
    let res = match req.method.as_str() {
        "health" => WsResponse::ok(
            id,
            json!({
                "runtime": "running",
                "protocol": PROTOCOL_VERSION,
            }),
        ),
        "status" => {
            let auth_mode = if state.required_token.is_some() {
                "token"
            } else {
                "none"
            };
            WsResponse::ok(
                id,
                json!({
                    "runtime": "running",
                    "protocol": PROTOCOL_VERSION,
                    "port": state.config.gateway.port,
                    "bind": state.config.gateway.bind,
                    "auth": auth_mode,
                    "retryDelayMs": coordinator.retry_delay().as_millis() as u64,
                    "contexts": coordinator.contexts().await,
                    "startedAt": state.started_at.to_rfc3339(),
                }),
            )
        }
        "queue.enqueue" => {
            let p: EnqueueParams = parse_params(req, "queue.enqueue")?;
            match coordinator.enqueue(&p.context_key, &p.text).await {
                Ok(item_id) => WsResponse::ok(id, json!({ "id": item_id })),
                Err(e) => WsResponse::err(id, e.to_string()),
            }
        }
        "queue.remove" => {
            let p: ItemParams = parse_params(req, "queue.remove")?;
            acknowledge(id, coordinator.remove(&p.context_key, &p.id).await)
        }
        "queue.edit" => {
            let p: EditParams = parse_params(req, "queue.edit")?;
            acknowledge(id, coordinator.edit(&p.context_key, &p.id, &p.text).await)
        }
        "queue.clear" => {
            let p: ContextParams = parse_params(req, "queue.clear")?;
            acknowledge(id, coordinator.clear(&p.context_key).await)
        }
        "queue.pause" => {
            let p: ContextParams = parse_params(req, "queue.pause")?;
            acknowledge(id, coordinator.pause(&p.context_key).await)
        }
        "queue.resume" => {
            let p: ContextParams = parse_params(req, "queue.resume")?;
            acknowledge(id, coordinator.resume(&p.context_key).await)
        }
        "queue.get" => {
            let p: ContextParams = parse_params(req, "queue.get")?;
            let snapshot = coordinator
                .get_state(&p.context_key)
                .await
                .map_err(|e| WsResponse::err(id, e.to_string()))?;
            WsResponse::ok(id, serde_json::to_value(&snapshot).unwrap_or(json!({})))
        }
        "queue.status" => {
            let p: ContextParams = parse_params(req, "queue.status")?;
            let status = coordinator
                .status(&p.context_key)
                .await
                .map_err(|e| WsResponse::err(id, e.to_string()))?;
            WsResponse::ok(id, serde_json::to_value(&status).unwrap_or(json!({})))
        }
        "queue.subscribe" => {
            let p: ContextParams = parse_params(req, "queue.subscribe")?;
            let snapshot = coordinator
                .get_state(&p.context_key)
                .await
                .map_err(|e| WsResponse::err(id, e.to_string()))?;
            conn.subscriptions.insert(p.context_key);
            WsResponse::ok(id, serde_json::to_value(&snapshot).unwrap_or(json!({})))
        }
        "queue.unsubscribe" => {
            let p: ContextParams = parse_params(req, "queue.unsubscribe")?;
            conn.subscriptions.remove(&p.context_key);
            WsResponse::ok(id, json!({}))
        }
        "driver.attach" => {
            let p: ContextParams = parse_params(req, "driver.attach")?;
            let driver = Arc::new(SocketDriver {
                id: conn.id.clone(),
                tx: conn.out_tx.clone(),
            });
            coordinator
                .drivers()
                .register(p.context_key.clone(), driver)
                .await;
            log::info!("connection {} attached as driver for {}", conn.id, p.context_key);
            coordinator.evaluate(&p.context_key).await;
            WsResponse::ok(id, json!({}))
        }
        "driver.detach" => {
            let p: ContextParams = parse_params(req, "driver.detach")?;
            let detached = coordinator
                .drivers()
                .unregister(&p.context_key, &conn.id)
                .await;
            if detached {
                coordinator.driver_gone(&p.context_key).await;
            }
            WsResponse::ok(id, json!({ "detached": detached }))
        }
        "driver.pageState" => {
            let p: PageStateParams = parse_params(req, "driver.pageState")?;
            require_driver(state, conn, id, &p.context_key).await?;
            coordinator.page_state(&p.context_key, p.busy).await;
            WsResponse::ok(id, json!({}))
        }
        "driver.submitted" => {
            let p: ItemParams = parse_params(req, "driver.submitted")?;
            require_driver(state, conn, id, &p.context_key).await?;
            let outcome = match coordinator.submitted(&p.context_key, &p.id).await {
                SubmitOutcome::Advanced => "advanced",
                SubmitOutcome::Desync => "desync",
            };
            WsResponse::ok(id, json!({ "outcome": outcome }))
        }
        "driver.error" => {
            let p: DriverErrorParams = parse_params(req, "driver.error")?;
            require_driver(state, conn, id, &p.context_key).await?;
            coordinator
                .failed(&p.context_key, p.id.as_deref(), &p.message)
                .await;
            WsResponse::ok(id, json!({}))
        }
        _ => WsResponse::err(id, format!("unknown method: {}", req.method)),
    };
    Ok(res)
}
