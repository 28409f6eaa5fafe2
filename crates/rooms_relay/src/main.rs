/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod registry;
mod relay;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use rooms_protocol::{ClientEvent, ServerEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, warn};

use crate::registry::SessionId;
use crate::relay::{start_relay, RelayHandle};

#[derive(Debug, Clone)]
struct RelayConfig {
    bind: SocketAddr,
    session_queue: usize,
    max_frame_bytes: usize,
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<RelayConfig>,
    relay: RelayHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = load_config()?;
    let addr = cfg.bind;
    let relay = start_relay(cfg.session_queue);
    let state = AppState {
        cfg: Arc::new(cfg),
        relay,
    };

    let app = router(state);

    info!("rooms_relay listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;
    info!("rooms_relay stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/create-room", post(create_room))
        .route("/join-room/:room_id", post(join_room))
        .route("/ws", get(session_ws))
        .route("/healthz", get(healthz))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                info_span!("http", method = %req.method(), uri = %req.uri())
            }),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("ctrl_c handler failed: {e}");
    }
    info!("shutdown requested");
}

fn load_config() -> Result<RelayConfig> {
    let bind = std::env::var("ROOMS_RELAY_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let bind: SocketAddr = bind
        .parse()
        .with_context(|| format!("ROOMS_RELAY_BIND invalid: {bind}"))?;
    let session_queue = std::env::var("ROOMS_RELAY_SESSION_QUEUE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1024)
        .clamp(16, 65_536);
    let max_frame_bytes = std::env::var("ROOMS_RELAY_MAX_FRAME_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256 * 1024)
        .clamp(1024, 4 * 1024 * 1024);
    Ok(RelayConfig {
        bind,
        session_queue,
        max_frame_bytes,
    })
}

#[derive(Debug, Deserialize)]
struct UsernameReq {
    #[serde(default)]
    username: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct CreateRoomResp {
    room_id: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct JoinRoomResp {
    room_id: String,
    username: String,
}

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, msg.to_string()).into_response()
}

async fn create_room(Json(req): Json<UsernameReq>) -> Response {
    let username = req.username.trim().to_string();
    if username.is_empty() {
        return bad_request("username required");
    }
    let room_id = uuid::Uuid::new_v4().to_string();
    info!(%username, room=%room_id, "room created");
    Json(CreateRoomResp { room_id }).into_response()
}

async fn join_room(
    Path(room_id): Path<String>,
    Json(req): Json<UsernameReq>,
) -> Response {
    let username = req.username.trim().to_string();
    if username.is_empty() {
        return bad_request("username required");
    }
    let room_id = room_id.trim().to_string();
    if room_id.is_empty() {
        return bad_request("room id required");
    }
    Json(JoinRoomResp { room_id, username }).into_response()
}

async fn healthz(State(state): State<AppState>) -> Response {
    match state.relay.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "ok": true,
            "rooms": stats.rooms,
            "sessions": stats.sessions,
            "names": stats.names,
        }))
        .into_response(),
        Err(e) => {
            error!("healthz: {e:#}");
            (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "ok": false }))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    username: Option<String>,
}

async fn session_ws(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(q): Query<SessionQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let max = state.cfg.max_frame_bytes;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_session(state, peer, q.username, socket))
}

fn default_username(session: SessionId, requested: Option<String>) -> String {
    requested
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("guest-{session}"))
}

/// Parses one inbound text frame. `None` means the frame is skipped.
fn parse_frame(session: SessionId, text: &str, max_bytes: usize) -> Option<ClientEvent> {
    if text.len() > max_bytes {
        warn!(session, len = text.len(), "frame skipped: too large");
        return None;
    }
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!(session, "frame skipped: {e}");
            None
        }
    }
}

async fn handle_session(state: AppState, peer: SocketAddr, username: Option<String>, socket: WebSocket) {
    let session = state.relay.next_session_id();
    let username = default_username(session, username);
    info!(session, %peer, %username, "session connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    if let Err(e) = state.relay.connect(session, username.clone(), tx).await {
        error!(session, "session rejected: {e:#}");
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            let json = match serde_json::to_string(&ev) {
                Ok(v) => v,
                Err(e) => {
                    error!(session, "serialize event failed: {e}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let max = state.cfg.max_frame_bytes;
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(session, "socket read failed: {e}");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                let Some(ev) = parse_frame(session, &text, max) else { continue };
                if let Err(e) = state.relay.inbound(session, ev).await {
                    error!(session, "relay unavailable: {e:#}");
                    break;
                }
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }

    if let Err(e) = state.relay.disconnect(session).await {
        error!(session, "disconnect not delivered: {e:#}");
    }
    let _ = writer.await;
    info!(session, %username, "session closed");
}
