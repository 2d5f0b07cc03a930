//! wirehttp host binary.
//!
//! Serves a small set of built-in handlers over the transport, mostly
//! useful as a smoke test and as a template for embedding the library.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌───────────────────────────────────────────────────────────┐
//!                  │                         wirehttp                          │
//!                  │                                                           │
//!   Client ────────┼─▶ net::listener ──▶ net::tls? ──▶ http::server (sniff)     │
//!                  │                                     │        │        │    │
//!                  │                         HTTP/1.x ◀──┘   h2c ─┘  PRI ──┘    │
//!                  │                            │              │                │
//!                  │                     h1::parser      h2::upgrade            │
//!                  │                            │              │                │
//!                  │                            │        h2::adapter (h2 crate) │
//!                  │                            ▼              ▼                │
//!                  │                      Request / Response + body stages      │
//!                  │                                  │                         │
//!                  │                                  ▼                         │
//!                  │                       http::dispatcher ──▶ handlers        │
//!                  │                                  │                         │
//!                  │                                  ▼                         │
//!                  │                      websocket (after hand-off)            │
//!                  │                                                           │
//!                  │   config · observability (tracing, metrics) · lifecycle   │
//!                  └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Handlers
//! - `GET /health`: plain-text liveness probe
//! - `/echo/*`: streams the request body back with the same content type
//! - `GET /ws`: WebSocket echo

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use http::StatusCode;

use wirehttp::config::{load_config, ServerConfig};
use wirehttp::lifecycle::signals::spawn_signal_handler;
use wirehttp::observability::{logging, metrics};
use wirehttp::websocket::{close_code, WsError};
use wirehttp::{handler_fn, Dispatcher, Handler, HttpServer, Listener, Shutdown};

#[derive(Debug, Parser)]
#[command(name = "wirehttp", version, about = "HTTP/1.x, HTTP/2 and WebSocket server")]
struct Cli {
    /// Path to a TOML configuration file; built-in defaults are used without one.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    logging::init(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "wirehttp starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        tls = config.listener.tls.is_some(),
        behind_proxy = config.listener.behind_proxy,
        compression = config.compression.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.add_exact("/health", health());
    dispatcher.add_exact("/ws", websocket_echo());
    dispatcher.add_prefix("/echo", echo());

    let server = HttpServer::new(&config, dispatcher)?;
    let listener = Listener::bind(&config.listener).await?;

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());
    server.run(listener, shutdown).await;
    Ok(())
}

fn health() -> Arc<dyn Handler> {
    handler_fn(|_req, res| {
        Box::pin(async move {
            res.send_text(StatusCode::OK, "OK").await?;
            Ok(())
        })
    })
}

fn echo() -> Arc<dyn Handler> {
    handler_fn(|req, res| {
        Box::pin(async move {
            if let Some(content_type) = req.content_type() {
                res.set_header("Content-Type", content_type)?;
            }
            let out = res.body_stream(None).await?;
            if let Some(body) = req.body() {
                tokio::io::copy(body, out).await?;
            }
            Ok(())
        })
    })
}

fn websocket_echo() -> Arc<dyn Handler> {
    handler_fn(|req, res| {
        Box::pin(async move {
            let ws = res.begin_websocket(req).await?;
            let mut starts_message = true;
            loop {
                let message = match ws.receive().await {
                    Ok(message) => message,
                    Err(WsError::Closed) => break,
                    Err(err) => {
                        tracing::debug!(error = %err, "WebSocket session failed");
                        break;
                    }
                };
                let sent = ws
                    .send_fragment(message.kind, &message.data, starts_message, message.is_last_segment)
                    .await;
                if let Err(err) = sent {
                    tracing::debug!(error = %err, "WebSocket echo stopped");
                    break;
                }
                starts_message = message.is_last_segment;
            }
            if !ws.is_closed() {
                let _ = ws.close(close_code::NORMAL, "").await;
            }
            Ok(())
        })
    })
}
