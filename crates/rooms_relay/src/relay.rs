/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use rooms_protocol::{
    ChatDelivery, ChatSend, ClientEvent, JoinRoom, JoinedRoom, Participant, ServerEvent,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::registry::{JoinOutcome, RoomRegistry, SessionId, SessionTx};

enum RelayCommand {
    Connect {
        session: SessionId,
        username: String,
        tx: SessionTx,
    },
    Inbound {
        session: SessionId,
        event: ClientEvent,
    },
    Disconnect {
        session: SessionId,
    },
    Stats {
        resp_tx: oneshot::Sender<RelayStats>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    pub rooms: usize,
    pub sessions: usize,
    pub names: usize,
}

/// Cheap clonable entry point to the dispatch loop. All room state lives in the
/// loop; callers only send commands.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayCommand>,
    next_session: Arc<AtomicU64>,
}

impl RelayHandle {
    pub fn next_session_id(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn connect(&self, session: SessionId, username: String, tx: SessionTx) -> Result<()> {
        self.tx
            .send(RelayCommand::Connect { session, username, tx })
            .await
            .context("relay connect")
    }

    pub async fn inbound(&self, session: SessionId, event: ClientEvent) -> Result<()> {
        self.tx
            .send(RelayCommand::Inbound { session, event })
            .await
            .context("relay inbound")
    }

    pub async fn disconnect(&self, session: SessionId) -> Result<()> {
        self.tx
            .send(RelayCommand::Disconnect { session })
            .await
            .context("relay disconnect")
    }

    pub async fn stats(&self) -> Result<RelayStats> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(RelayCommand::Stats { resp_tx })
            .await
            .context("relay stats")?;
        resp_rx.await.context("relay stats dropped")
    }
}

/// Spawns the dispatch loop. It stops once every handle is dropped.
pub fn start_relay(queue: usize) -> RelayHandle {
    let (tx, mut rx) = mpsc::channel::<RelayCommand>(queue.max(1));
    tokio::spawn(async move {
        let mut relay = Relay::new();
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RelayCommand::Connect { session, username, tx } => relay.connect(session, username, tx),
                RelayCommand::Inbound { session, event } => relay.handle(session, event),
                RelayCommand::Disconnect { session } => relay.disconnect(session),
                RelayCommand::Stats { resp_tx } => {
                    let _ = resp_tx.send(relay.stats());
                }
            }
        }
        info!("relay dispatch loop stopped");
    });
    RelayHandle {
        tx,
        next_session: Arc::new(AtomicU64::new(1)),
    }
}

/// Routing rules over a [`RoomRegistry`]. Every method runs to completion inside
/// one dispatch turn.
pub struct Relay {
    registry: RoomRegistry,
}

impl Relay {
    pub fn new() -> Self {
        Self {
            registry: RoomRegistry::new(),
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            rooms: self.registry.room_count(),
            sessions: self.registry.session_count(),
            names: self.registry.name_count(),
        }
    }

    pub fn connect(&mut self, session: SessionId, username: String, tx: SessionTx) {
        debug!(session, %username, "session registered");
        self.registry.connect(session, username, tx);
    }

    pub fn disconnect(&mut self, session: SessionId) {
        let Some((room_id, username)) = self.registry.leave(session) else {
            return;
        };
        let remaining = self.registry.members(&room_id).len();
        info!(session, room=%room_id, %username, remaining, "left room");
        let notice = ServerEvent::ParticipantLeft(Participant { username });
        self.registry.broadcast(&room_id, session, &notice);
    }

    pub fn handle(&mut self, session: SessionId, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom(join) => self.join(session, join),
            ClientEvent::Message(chat) => self.chat(session, chat),
            signal => self.relay(session, signal),
        }
    }

    fn join(&mut self, session: SessionId, join: JoinRoom) {
        let room_id = join.room_id.trim().to_string();
        if room_id.is_empty() {
            warn!(session, "join ignored: empty room id");
            return;
        }
        if let Some(name) = join.username.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            self.registry.rename(session, name);
        }
        match self.registry.join(session, &room_id) {
            JoinOutcome::Joined => {
                let username = self.registry.username_of(session).unwrap_or_default().to_string();
                let same_name = self.registry.sessions_using_name(&username);
                info!(session, room=%room_id, %username, same_name, "joined room");
                self.registry.deliver(
                    session,
                    ServerEvent::JoinedRoom(JoinedRoom { room_id: room_id.clone() }),
                );
                let notice = ServerEvent::ParticipantJoined(Participant { username });
                self.registry.broadcast(&room_id, session, &notice);
            }
            JoinOutcome::Rejoined => {
                self.registry
                    .deliver(session, ServerEvent::JoinedRoom(JoinedRoom { room_id }));
            }
            JoinOutcome::AlreadyBound(bound) => {
                warn!(session, requested=%room_id, bound=%bound, "join ignored: session already bound to a room");
            }
            JoinOutcome::UnknownSession => {
                warn!(session, "join ignored: unknown session");
            }
        }
    }

    /// The bound room of `session` if it matches the room the frame claims.
    fn source_room(&self, session: SessionId, claimed: &str) -> Option<String> {
        let Some(room_id) = self.registry.room_of(session) else {
            debug!(session, "frame dropped: session has not joined a room");
            return None;
        };
        if room_id != claimed {
            warn!(session, bound=%room_id, claimed=%claimed, "frame dropped: room mismatch");
            return None;
        }
        Some(room_id.to_string())
    }

    fn chat(&mut self, session: SessionId, chat: ChatSend) {
        let Some(room_id) = self.source_room(session, &chat.room_id) else {
            return;
        };
        let by = if chat.username.trim().is_empty() {
            self.registry.username_of(session).unwrap_or_default().to_string()
        } else {
            chat.username
        };
        let out = ServerEvent::Message(ChatDelivery { by, message: chat.message });
        let n = self.registry.broadcast(&room_id, session, &out);
        debug!(session, room=%room_id, delivered = n, "chat relayed");
    }

    /// Store-and-forward of one negotiation frame: targeted when `to` is set,
    /// room broadcast otherwise. No acknowledgment, no retry.
    fn relay(&mut self, session: SessionId, event: ClientEvent) {
        let Some(kind) = event.signal_kind() else {
            return;
        };
        let Some(room_id) = self.source_room(session, event.room_id()) else {
            return;
        };
        let target = event.target().map(str::to_string);
        let out = match event {
            ClientEvent::Offer(v) => ServerEvent::Offer(v),
            ClientEvent::Answer(v) => ServerEvent::Answer(v),
            ClientEvent::Candidate(v) => ServerEvent::Candidate(v),
            ClientEvent::JoinRoom(_) | ClientEvent::Message(_) => return,
        };
        let delivered = match target.as_deref() {
            Some(to) => self.registry.send_to_participant(&room_id, to, session, &out),
            None => self.registry.broadcast(&room_id, session, &out),
        };
        if delivered == 0 {
            debug!(session, kind = kind.as_str(), target = ?target, "signal dropped: no recipient");
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rooms_protocol::{CandidateSignal, IceCandidate, OfferSignal, SdpKind, SessionDescription};

    fn connect(relay: &mut Relay, id: SessionId, name: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        relay.connect(id, name.to_string(), tx);
        rx
    }

    fn join(relay: &mut Relay, id: SessionId, room: &str) {
        relay.handle(
            id,
            ClientEvent::JoinRoom(JoinRoom { room_id: room.to_string(), username: None }),
        );
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn offer(from: &str, room: &str, to: Option<&str>) -> ClientEvent {
        ClientEvent::Offer(OfferSignal {
            offer: SessionDescription { kind: SdpKind::Offer, sdp: "v=0".to_string() },
            from: from.to_string(),
            room_id: room.to_string(),
            to: to.map(str::to_string),
        })
    }

    #[test]
    fn join_replies_and_announces() {
        let mut relay = Relay::new();
        let mut a = connect(&mut relay, 1, "alice");
        let mut b = connect(&mut relay, 2, "bob");
        join(&mut relay, 1, "r1");
        assert_eq!(
            drain(&mut a),
            vec![ServerEvent::JoinedRoom(JoinedRoom { room_id: "r1".to_string() })]
        );
        join(&mut relay, 2, "r1");
        assert_eq!(
            drain(&mut a),
            vec![ServerEvent::ParticipantJoined(Participant { username: "bob".to_string() })]
        );
        assert_eq!(
            drain(&mut b),
            vec![ServerEvent::JoinedRoom(JoinedRoom { room_id: "r1".to_string() })]
        );
        // Re-join answers again without a second announcement.
        join(&mut relay, 2, "r1");
        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b).len(), 1);
    }

    #[test]
    fn chat_stays_inside_the_room() {
        let mut relay = Relay::new();
        let mut a = connect(&mut relay, 1, "alice");
        let mut b = connect(&mut relay, 2, "bob");
        let mut c = connect(&mut relay, 3, "carol");
        join(&mut relay, 1, "r1");
        join(&mut relay, 2, "r1");
        join(&mut relay, 3, "r2");
        drain(&mut a);
        drain(&mut b);
        drain(&mut c);

        relay.handle(
            1,
            ClientEvent::Message(ChatSend {
                username: "alice".to_string(),
                room_id: "r1".to_string(),
                message: "hi".to_string(),
            }),
        );
        relay.handle(
            3,
            ClientEvent::Message(ChatSend {
                username: "carol".to_string(),
                room_id: "r2".to_string(),
                message: "elsewhere".to_string(),
            }),
        );

        assert_eq!(
            drain(&mut b),
            vec![ServerEvent::Message(ChatDelivery { by: "alice".to_string(), message: "hi".to_string() })]
        );
        assert!(drain(&mut a).is_empty(), "sender must not get its own line back");
        assert!(drain(&mut c).iter().all(|ev| !matches!(ev, ServerEvent::Message(m) if m.message == "hi")));
    }

    #[test]
    fn signals_broadcast_or_target() {
        let mut relay = Relay::new();
        let mut a = connect(&mut relay, 1, "alice");
        let mut b = connect(&mut relay, 2, "bob");
        let mut c = connect(&mut relay, 3, "carol");
        for id in 1..=3 {
            join(&mut relay, id, "r1");
        }
        drain(&mut a);
        drain(&mut b);
        drain(&mut c);

        relay.handle(1, offer("alice", "r1", None));
        assert_eq!(drain(&mut b).len(), 1);
        assert_eq!(drain(&mut c).len(), 1);
        assert!(drain(&mut a).is_empty());

        relay.handle(1, offer("alice", "r1", Some("carol")));
        assert!(drain(&mut b).is_empty());
        let got = drain(&mut c);
        assert!(matches!(&got[..], [ServerEvent::Offer(o)] if o.to.as_deref() == Some("carol")));
    }

    #[test]
    fn missing_target_is_a_silent_no_op() {
        let mut relay = Relay::new();
        let mut a = connect(&mut relay, 1, "alice");
        let mut b = connect(&mut relay, 2, "bob");
        join(&mut relay, 1, "r1");
        join(&mut relay, 2, "r1");
        drain(&mut a);
        drain(&mut b);

        relay.handle(
            1,
            ClientEvent::Candidate(CandidateSignal {
                candidate: IceCandidate {
                    candidate: "candidate:1 1 UDP 1 10.0.0.1 9 typ host".to_string(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                    username_fragment: None,
                },
                from: "alice".to_string(),
                room_id: "r1".to_string(),
                to: Some("ghost".to_string()),
            }),
        );
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut b).is_empty());
        assert_eq!(relay.stats().sessions, 2);
    }

    #[test]
    fn frames_claiming_another_room_are_dropped() {
        let mut relay = Relay::new();
        let mut a = connect(&mut relay, 1, "alice");
        let mut b = connect(&mut relay, 2, "bob");
        join(&mut relay, 1, "r1");
        join(&mut relay, 2, "r2");
        drain(&mut a);
        drain(&mut b);

        relay.handle(1, offer("alice", "r2", None));
        assert!(drain(&mut b).is_empty());

        // Not joined yet: nothing to route.
        let mut c = connect(&mut relay, 3, "carol");
        relay.handle(3, offer("carol", "r1", None));
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut c).is_empty());
    }

    #[test]
    fn disconnect_notifies_the_room_once() {
        let mut relay = Relay::new();
        let mut a = connect(&mut relay, 1, "alice");
        let _b = connect(&mut relay, 2, "bob");
        join(&mut relay, 1, "r1");
        join(&mut relay, 2, "r1");
        drain(&mut a);

        assert_eq!(relay.stats().names, 2);
        relay.disconnect(2);
        relay.disconnect(2);
        assert_eq!(
            drain(&mut a),
            vec![ServerEvent::ParticipantLeft(Participant { username: "bob".to_string() })]
        );
        assert_eq!(relay.registry().members("r1"), vec![1]);
        assert_eq!(relay.stats().names, 1);
    }

    #[tokio::test]
    async fn handle_routes_through_the_dispatch_loop() {
        let handle = start_relay(16);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = handle.next_session_id();
        let b = handle.next_session_id();
        assert_ne!(a, b);
        handle.connect(a, "alice".to_string(), tx_a).await.unwrap();
        handle.connect(b, "bob".to_string(), tx_b).await.unwrap();
        for id in [a, b] {
            handle
                .inbound(id, ClientEvent::JoinRoom(JoinRoom { room_id: "r1".to_string(), username: None }))
                .await
                .unwrap();
        }
        handle.inbound(a, offer("alice", "r1", Some("bob"))).await.unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.rooms, 1);
        assert_eq!(stats.sessions, 2);

        assert!(matches!(rx_b.recv().await, Some(ServerEvent::JoinedRoom(_))));
        assert!(matches!(rx_b.recv().await, Some(ServerEvent::Offer(_))));

        handle.disconnect(b).await.unwrap();
        assert!(matches!(rx_a.recv().await, Some(ServerEvent::JoinedRoom(_))));
        assert!(matches!(rx_a.recv().await, Some(ServerEvent::ParticipantJoined(_))));
        assert!(matches!(rx_a.recv().await, Some(ServerEvent::ParticipantLeft(_))));
    }
}
