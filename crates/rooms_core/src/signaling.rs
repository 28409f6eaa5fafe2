/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rooms_protocol::{ClientEvent, ServerEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tracing::{debug, error, info, warn};

/// Live connection to the relay. Dropping `outbound` closes the socket.
pub struct SignalingSession {
    pub outbound: mpsc::Sender<ClientEvent>,
    pub inbound: mpsc::Receiver<ServerEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalingSession {
    pub fn shutdown(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub fn decode_frame(text: &str) -> Option<ServerEvent> {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!("signaling frame skipped: {e}");
            None
        }
    }
}

pub async fn connect(url: &str, queue: usize) -> Result<SignalingSession> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("connect {url}"))?;
    info!(%url, "signaling connected");
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (out_tx, mut out_rx) = mpsc::channel::<ClientEvent>(queue.max(1));
    let (in_tx, in_rx) = mpsc::channel::<ServerEvent>(queue.max(1));

    let writer = tokio::spawn(async move {
        while let Some(ev) = out_rx.recv().await {
            let json = match serde_json::to_string(&ev) {
                Ok(v) => v,
                Err(e) => {
                    error!("serialize event failed: {e}");
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(tungstenite::Message::Text(json)).await {
                warn!("signaling send failed: {e}");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            let text = match msg {
                Ok(tungstenite::Message::Text(t)) => t,
                Ok(tungstenite::Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!("signaling read failed: {e}");
                    break;
                }
            };
            let Some(ev) = decode_frame(&text) else { continue };
            if in_tx.send(ev).await.is_err() {
                break;
            }
        }
        debug!("signaling reader stopped");
    });

    Ok(SignalingSession {
        outbound: out_tx,
        inbound: in_rx,
        reader,
        writer,
    })
}

#[derive(Debug, Serialize)]
struct UsernameBody<'a> {
    username: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomResp {
    room_id: String,
}

/// `POST /create-room`, returns the new room id.
pub async fn create_room(http: &reqwest::Client, base: &str, username: &str) -> Result<String> {
    let url = format!("{}/create-room", base.trim_end_matches('/'));
    let resp = http
        .post(&url)
        .json(&UsernameBody { username })
        .send()
        .await
        .with_context(|| format!("POST {url}"))?
        .error_for_status()
        .context("create room rejected")?;
    let body: RoomResp = resp.json().await.context("decode create-room response")?;
    Ok(body.room_id)
}

/// `POST /join-room/:roomId`, validates the username with the relay.
pub async fn join_room(http: &reqwest::Client, base: &str, room_id: &str, username: &str) -> Result<String> {
    let url = format!(
        "{}/join-room/{}",
        base.trim_end_matches('/'),
        urlencoding::encode(room_id)
    );
    let resp = http
        .post(&url)
        .json(&UsernameBody { username })
        .send()
        .await
        .with_context(|| format!("POST {url}"))?
        .error_for_status()
        .context("join room rejected")?;
    let body: RoomResp = resp.json().await.context("decode join-room response")?;
    Ok(body.room_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_relay_frames_and_skips_garbage() {
        let ev = decode_frame(r#"{"event":"participantJoined","data":{"username":"bob"}}"#);
        assert!(matches!(ev, Some(ServerEvent::ParticipantJoined(p)) if p.username == "bob"));
        let ev = decode_frame(r#"{"event":"message","data":{"by":"bob","message":"hi"}}"#);
        assert!(matches!(ev, Some(ServerEvent::Message(m)) if m.by == "bob"));
        assert!(decode_frame(r#"{"event":"unknown","data":{}}"#).is_none());
        assert!(decode_frame("").is_none());
    }
}
