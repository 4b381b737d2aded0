use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Parser)]
#[command(name = "chatq")]
#[command(about = "chatq CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone)]
struct ConfigArg {
    /// Config file path (default: CHATQ_CONFIG_PATH or ~/.chatq/config.json)
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory, a default config and the queue state directory.
    Init {
        #[command(flatten)]
        config: ConfigArg,
    },

    /// Run the gateway (HTTP + WebSocket control plane for queues and page drivers).
    Gateway {
        #[command(flatten)]
        config: ConfigArg,

        /// WebSocket and HTTP port (default from config or 15152)
        #[arg(long, short)]
        port: Option<u16>,

        /// Keep queue state in memory only (nothing survives a restart).
        #[arg(long)]
        ephemeral: bool,
    },

    /// Queue a message for a conversation; prints the new item id.
    Enqueue {
        #[command(flatten)]
        config: ConfigArg,
        /// Conversation key (e.g. a browser tab id)
        key: String,
        text: String,
    },

    /// Remove a queued item.
    Remove {
        #[command(flatten)]
        config: ConfigArg,
        key: String,
        id: String,
    },

    /// Replace the text of a queued item.
    Edit {
        #[command(flatten)]
        config: ConfigArg,
        key: String,
        id: String,
        text: String,
    },

    /// Drop every queued item for a conversation.
    Clear {
        #[command(flatten)]
        config: ConfigArg,
        key: String,
    },

    /// Stop dispatching for a conversation.
    Pause {
        #[command(flatten)]
        config: ConfigArg,
        key: String,
    },

    /// Resume dispatching for a conversation.
    Resume {
        #[command(flatten)]
        config: ConfigArg,
        key: String,
    },

    /// Print the queue and dispatch status of a conversation.
    State {
        #[command(flatten)]
        config: ConfigArg,
        key: String,
    },

    /// Follow queue state changes and warnings for a conversation.
    Watch {
        #[command(flatten)]
        config: ConfigArg,
        key: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Some(Commands::Gateway { .. }) => "info",
        _ => "warn",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("chatq {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config.config),
        Some(Commands::Gateway {
            config,
            port,
            ephemeral,
        }) => run_gateway(config.config, port, ephemeral).await,
        Some(Commands::Enqueue { config, key, text }) => {
            control(config, "queue.enqueue", json!({ "contextKey": key, "text": text }))
                .await
                .map(|payload| {
                    println!("{}", payload["id"].as_str().unwrap_or_default());
                })
        }
        Some(Commands::Remove { config, key, id }) => {
            control(config, "queue.remove", json!({ "contextKey": key, "id": id }))
                .await
                .map(drop)
        }
        Some(Commands::Edit {
            config,
            key,
            id,
            text,
        }) => control(
            config,
            "queue.edit",
            json!({ "contextKey": key, "id": id, "text": text }),
        )
        .await
        .map(drop),
        Some(Commands::Clear { config, key }) => {
            control(config, "queue.clear", json!({ "contextKey": key }))
                .await
                .map(drop)
        }
        Some(Commands::Pause { config, key }) => {
            control(config, "queue.pause", json!({ "contextKey": key }))
                .await
                .map(drop)
        }
        Some(Commands::Resume { config, key }) => {
            control(config, "queue.resume", json!({ "contextKey": key }))
                .await
                .map(drop)
        }
        Some(Commands::State { config, key }) => {
            control(config, "queue.status", json!({ "contextKey": key }))
                .await
                .map(|payload| print_status(&payload))
        }
        Some(Commands::Watch { config, key }) => run_watch(config, key).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };

    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(chatq::config::default_config_path);
    let dir = chatq::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    ephemeral: bool,
) -> anyhow::Result<()> {
    let (mut config, path) = chatq::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    if ephemeral {
        log::info!("ephemeral mode: queue state is kept in memory only");
        let store = std::sync::Arc::new(chatq::store::MemoryQueueStore::new());
        chatq::gateway::serve(config, store).await
    } else {
        chatq::gateway::run_gateway(config, path).await
    }
}

fn print_status(payload: &Value) {
    let paused = payload["paused"].as_bool().unwrap_or(false);
    let state = payload["state"].as_str().unwrap_or("unknown");
    let in_flight = payload["inFlight"].as_str();
    println!(
        "state: {}{}",
        state,
        if paused { " (paused)" } else { "" }
    );
    let items = payload["items"].as_array().cloned().unwrap_or_default();
    if items.is_empty() {
        println!("queue is empty");
        return;
    }
    for (i, item) in items.iter().enumerate() {
        let id = item["id"].as_str().unwrap_or_default();
        let marker = if Some(id) == in_flight { "*" } else { " " };
        println!(
            "{}{:>3}. [{}] {}",
            marker,
            i + 1,
            id,
            item["text"].as_str().unwrap_or_default()
        );
    }
}

async fn run_watch(config: ConfigArg, key: String) -> anyhow::Result<()> {
    let mut client = GatewayClient::connect(config.config).await?;
    let initial = client
        .request("queue.subscribe", json!({ "contextKey": key }))
        .await?;
    println!("{}", initial);
    loop {
        let frame = client.next_frame().await?;
        match frame["event"].as_str() {
            Some("queue.state") | Some("queue.warning") => println!("{}", frame),
            Some("shutdown") => {
                println!("gateway shutting down");
                return Ok(());
            }
            _ => {}
        }
    }
}

/// Connect, send one controller request, return its payload.
async fn control(config: ConfigArg, method: &str, params: Value) -> anyhow::Result<Value> {
    let mut client = GatewayClient::connect(config.config).await?;
    client.request(method, params).await
}

/// Minimal WebSocket client for the gateway protocol.
struct GatewayClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl GatewayClient {
    async fn connect(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (config, _) = chatq::config::load_config(config_path)?;
        let bind = config.gateway.bind.trim();
        let ws_url = format!("ws://{}:{}/ws", bind, config.gateway.port);
        let (ws, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .with_context(|| format!("connecting to gateway at {}", ws_url))?;
        let mut client = Self { ws, next_id: 0 };

        let mut params = json!({
            "client": { "id": "chatq-cli", "version": env!("CARGO_PKG_VERSION") },
            "role": "controller",
        });
        if let Some(token) = chatq::config::resolve_gateway_token(&config) {
            params["auth"] = json!({ "token": token });
        }
        client.request("connect", params).await?;
        Ok(client)
    }

    async fn next_frame(&mut self) -> anyhow::Result<Value> {
        while let Some(msg) = self.ws.next().await {
            let Message::Text(text) = msg? else { continue };
            return Ok(serde_json::from_str(&text)?);
        }
        bail!("gateway closed the connection")
    }

    async fn request(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let req = json!({ "type": "req", "id": id, "method": method, "params": params });
        self.ws.send(Message::Text(req.to_string())).await?;
        loop {
            let res = self.next_frame().await?;
            if res.get("type").and_then(|v| v.as_str()) != Some("res")
                || res.get("id").and_then(|v| v.as_str()) != Some(id.as_str())
            {
                continue;
            }
            if !res.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
                let err = res
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("request failed");
                return Err(anyhow!("{}: {}", method, err));
            }
            return Ok(res.get("payload").cloned().unwrap_or(Value::Null));
        }
    }
}
