//! The WebSocket↔UDP relay.
//!
//! Each upgraded stream owns one UDP socket: every complete binary
//! message becomes one datagram to the target pinned at upgrade time,
//! and every inbound datagram becomes one binary message. The relay is
//! deliberately a dumb wire; it never interprets payloads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

/// Default target UDP port when the upgrade request names none.
const DEFAULT_TARGET_PORT: u16 = 9987;

/// Largest UDP payload; a single websocket message never produces more
/// than one datagram.
const UDP_BUFFER_SIZE: usize = 65536;

/// Relay configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Listener port (`PROXY_PORT`, default 9988).
    pub port: u16,
    /// Shared upgrade token (`PROXY_SECRET`; generated and logged when unset).
    pub secret: String,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PROXY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(9988);
        let secret = match std::env::var("PROXY_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                let mut bytes = [0u8; 16];
                OsRng.fill_bytes(&mut bytes);
                let secret = hex::encode(bytes);
                tracing::warn!("PROXY_SECRET not set, generated token: {}", secret);
                secret
            }
        };
        Self { port, secret }
    }
}

/// One relayed client in the process-wide table.
struct ClientEntry {
    target: String,
    cancel: CancellationToken,
}

/// Shared relay state: the token and the live client table.
pub struct RelayState {
    secret: String,
    started: Instant,
    next_id: AtomicU64,
    clients: Mutex<HashMap<u64, ClientEntry>>,
}

impl RelayState {
    pub fn new(secret: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            secret: secret.into(),
            started: Instant::now(),
            next_id: AtomicU64::new(1),
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Cancel every live session; called on SIGINT before the listener
    /// goes down.
    pub async fn shutdown(&self) {
        let clients = self.clients.lock().await;
        for (id, entry) in clients.iter() {
            tracing::info!("closing relay session {} -> {}", id, entry.target);
            entry.cancel.cancel();
        }
    }

    async fn register(&self, target: String) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.clients.lock().await.insert(
            id,
            ClientEntry {
                target,
                cancel: cancel.clone(),
            },
        );
        (id, cancel)
    }

    async fn unregister(&self, id: u64) {
        self.clients.lock().await.remove(&id);
    }
}

#[derive(Debug, Deserialize)]
struct UpgradeParams {
    token: Option<String>,
    host: Option<String>,
    port: Option<u16>,
}

/// Build the relay router: upgrade at `/`, health at `/health`.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .route("/health", get(health))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

async fn health(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime": state.started.elapsed().as_secs_f64(),
    }))
}

async fn upgrade(
    State(state): State<Arc<RelayState>>,
    Query(params): Query<UpgradeParams>,
    ws: WebSocketUpgrade,
) -> Response {
    // Token first: an unauthorized client never gets a UDP socket.
    if params.token.as_deref() != Some(state.secret.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(host) = params.host else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let port = params.port.unwrap_or(DEFAULT_TARGET_PORT);

    ws.on_upgrade(move |socket| client_session(state, socket, host, port))
}

async fn client_session(state: Arc<RelayState>, socket: WebSocket, host: String, port: u16) {
    let udp = match open_target_socket(&host, port).await {
        Ok(udp) => udp,
        Err(e) => {
            tracing::warn!("relay target {}:{} unreachable: {}", host, port, e);
            return;
        }
    };

    let target = format!("{}:{}", host, port);
    let (id, cancel) = state.register(target.clone()).await;
    tracing::info!("relay session {} opened -> {}", id, target);

    let (rx_bytes, tx_bytes) = pump(socket, &udp, &cancel).await;

    state.unregister(id).await;
    tracing::info!(
        "relay session {} closed ({} bytes to udp, {} bytes to ws)",
        id,
        rx_bytes,
        tx_bytes
    );
}

async fn open_target_socket(host: &str, port: u16) -> std::io::Result<UdpSocket> {
    let udp = UdpSocket::bind("0.0.0.0:0").await?;
    udp.connect((host, port)).await?;
    Ok(udp)
}

/// Shuffle messages until either side closes. Returns (ws→udp, udp→ws)
/// byte totals.
async fn pump(mut socket: WebSocket, udp: &UdpSocket, cancel: &CancellationToken) -> (u64, u64) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    let mut to_udp = 0u64;
    let mut to_ws = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            message = socket.recv() => match message {
                Some(Ok(Message::Binary(data))) => {
                    to_udp += data.len() as u64;
                    // Datagram-atomic: the websocket layer has already
                    // reassembled any fragmented message.
                    if let Err(e) = udp.send(&data).await {
                        tracing::warn!("udp send of {} bytes failed: {}", data.len(), e);
                    }
                }
                Some(Ok(Message::Text(_))) => {}
                // Pings are answered by the websocket layer per RFC 6455.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!("websocket receive failed: {}", e);
                    break;
                }
            },

            result = udp.recv(&mut buf) => match result {
                Ok(n) => {
                    to_ws += n as u64;
                    if socket.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // Usually an ICMP unreachable bounce; the stream
                    // itself is still fine.
                    tracing::warn!("udp recv failed: {}", e);
                }
            },
        }
    }
    (to_udp, to_ws)
}
