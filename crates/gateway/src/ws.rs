//! WebSocket transport.
//!
//! - `GET /ws`: upgrade; token from `?token=` or `Authorization: Bearer`
//! - `GET /health`: liveness probe
//!
//! Frames are JSON `{"event": "...", "data": {...}}` in both directions.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, header::AUTHORIZATION},
    response::{IntoResponse, Json},
    routing::get,
};
use elowen_core::{ConnectionId, OutboundEvent};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::relay::RelayServer;

/// Per-socket transport knobs.
#[derive(Debug, Clone)]
pub struct WsSettings {
    pub ping_interval: Duration,
    pub outbound_buffer: usize,
}

impl WsSettings {
    pub fn from_config(config: &elowen_config::GatewayConfig) -> Self {
        Self {
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            outbound_buffer: config.outbound_buffer,
        }
    }
}

impl Default for WsSettings {
    fn default() -> Self {
        Self::from_config(&elowen_config::GatewayConfig::default())
    }
}

#[derive(Clone)]
struct WsState {
    relay: Arc<RelayServer>,
    settings: WsSettings,
}

/// Build the router serving the relay.
pub fn router(relay: Arc<RelayServer>, settings: WsSettings) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(WsState { relay, settings })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    #[serde(default)]
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<WsState>,
) -> impl IntoResponse {
    let token = params.token.or_else(|| bearer_token(&headers));
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
}

async fn handle_socket(socket: WebSocket, state: WsState, token: Option<String>) {
    let connection = ConnectionId::new();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<OutboundEvent>(state.settings.outbound_buffer);
    let ping_interval = state.settings.ping_interval;

    // Writer: drain the outbound queue, ping when idle
    let writer_connection = connection.clone();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;

        loop {
            let frame = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => match serde_json::to_string(&event) {
                        Ok(json) => WsMessage::Text(json.into()),
                        Err(e) => {
                            warn!(connection = %writer_connection, error = %e, "Failed to encode event");
                            continue;
                        }
                    },
                    None => break,
                },
                _ = ping.tick() => WsMessage::Ping(Bytes::new()),
            };

            if sender.send(frame).await.is_err() {
                debug!(connection = %writer_connection, "Socket closed while writing");
                break;
            }
        }
        let _ = sender.close().await;
    });

    state.relay.connect(connection.clone(), token.as_deref(), tx).await;

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => state.relay.dispatch_text(&connection, text.as_str()).await,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue, // binary, ping, pong
            Err(e) => {
                debug!(connection = %connection, error = %e, "Socket read failed");
                break;
            }
        }
    }

    state.relay.disconnect(&connection).await;
    writer.abort();
}
