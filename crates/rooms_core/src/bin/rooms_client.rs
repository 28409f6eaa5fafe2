/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use anyhow::Result;
use rooms_core::chat::ChatChannel;
use rooms_core::config::load_client_config;
use rooms_core::now_ms;
use rooms_core::peer::{PeerConnectionManager, PeerManagerConfig};
use rooms_core::rtc::{LoggingRenderer, RtcLinkFactory, SyntheticMediaSource};
use rooms_core::signaling;
use rooms_protocol::{ClientEvent, JoinRoom, ServerEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = load_client_config()?;
    let http = reqwest::Client::new();
    let room_id = match cfg.room_id.as_deref() {
        Some(r) => signaling::join_room(&http, &cfg.server_http(), r, &cfg.username).await?,
        None => signaling::create_room(&http, &cfg.server_http(), &cfg.username).await?,
    };
    info!(room=%room_id, user=%cfg.username, "room ready");

    let mut session = signaling::connect(&cfg.session_url(), 256).await?;
    let (peers, link_events) = PeerConnectionManager::new(
        PeerManagerConfig {
            local_id: cfg.username.clone(),
            room_id: room_id.clone(),
            candidate_queue: cfg.candidate_queue,
        },
        Arc::new(RtcLinkFactory::new(&cfg.ice)?),
        Arc::new(SyntheticMediaSource::new(cfg.media_enabled, &cfg.username)),
        Arc::new(LoggingRenderer::default()),
        session.outbound.clone(),
    );
    let pump = peers.spawn_event_pump(link_events);
    if let Err(e) = peers.acquire_local_media().await {
        warn!("local media unavailable: {e}");
    }

    let chat = ChatChannel::new(&cfg.username, &room_id, &cfg.data_dir, session.outbound.clone());
    info!(cache = %chat.cache().path().display(), "chat cache");
    for line in chat.history(now_ms()) {
        println!("{line}");
    }

    session
        .outbound
        .send(ClientEvent::JoinRoom(JoinRoom {
            room_id: room_id.clone(),
            username: Some(cfg.username.clone()),
        }))
        .await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            ev = session.inbound.recv() => {
                let Some(ev) = ev else {
                    warn!("relay closed the session");
                    break;
                };
                dispatch(&peers, &chat, &cfg.username, ev).await;
            }
            line = stdin.next_line() => match line {
                Ok(Some(body)) => match chat.send(&body).await {
                    Ok(Some(line)) => println!("{line}"),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("chat send failed: {e:#}");
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    peers.leave_room().await;
    pump.abort();
    session.shutdown();
    info!("left room");
    Ok(())
}

/// Applies one relay frame. Frames are handled in arrival order so candidates
/// keep their order.
async fn dispatch(peers: &PeerConnectionManager, chat: &ChatChannel, me: &str, ev: ServerEvent) {
    let res = match ev {
        ServerEvent::JoinedRoom(j) => {
            info!(room=%j.room_id, "joined");
            Ok(())
        }
        ServerEvent::Message(m) => {
            println!("{}", chat.receive(&m.by, &m.message));
            Ok(())
        }
        ServerEvent::ParticipantJoined(p) if p.username != me => {
            info!(participant=%p.username, "participant joined");
            peers.initiate_connection(&p.username).await
        }
        ServerEvent::ParticipantJoined(_) => Ok(()),
        ServerEvent::ParticipantLeft(p) => {
            info!(participant=%p.username, "participant left");
            peers.on_peer_disconnected(&p.username).await;
            Ok(())
        }
        ServerEvent::Offer(o) if addressed_to(o.to.as_deref(), me) => peers.on_offer_received(&o.from, o.offer).await,
        ServerEvent::Answer(a) if addressed_to(a.to.as_deref(), me) => {
            peers.on_answer_received(&a.from, a.answer).await
        }
        ServerEvent::Candidate(c) if addressed_to(c.to.as_deref(), me) => {
            peers.on_candidate_received(&c.from, c.candidate).await
        }
        ServerEvent::Offer(_) | ServerEvent::Answer(_) | ServerEvent::Candidate(_) => Ok(()),
    };
    if let Err(e) = res {
        warn!("negotiation step failed: {e}");
    }
}

fn addressed_to(to: Option<&str>, me: &str) -> bool {
    to.map_or(true, |t| t == me)
}
