/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-participant negotiation state for one room.
//!
//! Every remote participant owns at most one entry. Each entry sits behind its
//! own async mutex, so negotiation steps for one participant run in order while
//! other participants proceed concurrently. Candidates that arrive before the
//! remote description are queued and applied once, in arrival order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rooms_protocol::{AnswerSignal, CandidateSignal, ClientEvent, IceCandidate, OfferSignal, SessionDescription};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub const DEFAULT_CANDIDATE_QUEUE: usize = 64;
/// Participants that may hold early candidates at once.
pub const MAX_EARLY_PARTICIPANTS: usize = 32;
/// Early candidates and closed-session markers older than this are forgotten.
pub const EARLY_CANDIDATE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    /// Local offer sent, answer pending.
    Offering,
    Answering,
    Connected,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("media access denied: {0}")]
    MediaAccess(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("signaling channel closed")]
    SignalingClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Captured local tracks, shared by every connection of the manager.
pub struct LocalMedia {
    tracks: Vec<Arc<TrackLocalStaticSample>>,
    capture: Option<JoinHandle<()>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<TrackLocalStaticSample>>, capture: Option<JoinHandle<()>>) -> Self {
        Self { tracks, capture }
    }

    pub fn tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.tracks
    }

    /// Stops the capture task. Tracks stay attached but go silent.
    pub fn release(&self) {
        if let Some(h) = &self.capture {
            h.abort();
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}

/// Inbound media for one participant.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    pub source: Option<Arc<TrackRemote>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone)]
pub enum LinkEventKind {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(LinkState),
}

/// Callback output of one link. `link_id` tells events of a replaced link
/// apart from the current one.
#[derive(Clone)]
pub struct LinkEvent {
    pub remote: String,
    pub link_id: u64,
    pub kind: LinkEventKind,
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_tracks(&self, media: &LocalMedia) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create(
        &self,
        remote: &str,
        link_id: u64,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, PeerError>;
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, PeerError>;
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn create_target(&self, participant: &str);
    async fn attach(&self, participant: &str, track: RemoteTrack);
    async fn release(&self, participant: &str);
}

#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    pub local_id: String,
    pub room_id: String,
    pub candidate_queue: usize,
}

struct PeerEntry {
    link: Option<Arc<dyn PeerLink>>,
    state: PeerState,
    remote_set: bool,
    pending: VecDeque<IceCandidate>,
    has_target: bool,
}

#[derive(Clone)]
struct Slot {
    link_id: u64,
    entry: Arc<Mutex<PeerEntry>>,
}

pub struct PeerConnectionManager {
    cfg: PeerManagerConfig,
    factory: Arc<dyn LinkFactory>,
    media: Arc<dyn MediaSource>,
    renderer: Arc<dyn Renderer>,
    signal_tx: mpsc::Sender<ClientEvent>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    slots: StdMutex<HashMap<String, Slot>>,
    early: StdMutex<EarlyCandidates>,
    local_media: Mutex<Option<Arc<LocalMedia>>>,
    next_link: AtomicU64,
}

fn push_bounded(queue: &mut VecDeque<IceCandidate>, candidate: IceCandidate, cap: usize, remote: &str) {
    if queue.len() >= cap.max(1) {
        queue.pop_front();
        warn!(remote, "candidate queue full, oldest dropped");
    }
    queue.push_back(candidate);
}

struct EarlyQueue {
    candidates: VecDeque<IceCandidate>,
    touched: Instant,
}

/// Candidates for participants without an entry yet, plus participants whose
/// session was just closed. Both are bounded in count and age.
#[derive(Default)]
struct EarlyCandidates {
    queues: HashMap<String, EarlyQueue>,
    closed: HashMap<String, Instant>,
}

fn evict_oldest<V>(map: &mut HashMap<String, V>, age: impl Fn(&V) -> Instant) {
    let oldest = map.iter().min_by_key(|(_, v)| age(v)).map(|(k, _)| k.clone());
    if let Some(key) = oldest {
        map.remove(&key);
        warn!(remote = %key, "early candidate table full, oldest participant dropped");
    }
}

impl EarlyCandidates {
    fn expire(&mut self, now: Instant) {
        self.queues.retain(|_, q| now.duration_since(q.touched) < EARLY_CANDIDATE_TTL);
        self.closed.retain(|_, at| now.duration_since(*at) < EARLY_CANDIDATE_TTL);
    }

    fn push(&mut self, remote: &str, candidate: IceCandidate, cap: usize) {
        let now = Instant::now();
        self.expire(now);
        if self.closed.contains_key(remote) {
            debug!(remote, "candidate dropped: session closed");
            return;
        }
        if !self.queues.contains_key(remote) && self.queues.len() >= MAX_EARLY_PARTICIPANTS {
            evict_oldest(&mut self.queues, |q| q.touched);
        }
        let queue = self.queues.entry(remote.to_string()).or_insert_with(|| EarlyQueue {
            candidates: VecDeque::new(),
            touched: now,
        });
        queue.touched = now;
        push_bounded(&mut queue.candidates, candidate, cap, remote);
    }

    /// Hands queued candidates to a new session for `remote`.
    fn take(&mut self, remote: &str) -> VecDeque<IceCandidate> {
        self.closed.remove(remote);
        match self.queues.remove(remote) {
            Some(q) if q.touched.elapsed() < EARLY_CANDIDATE_TTL => q.candidates,
            _ => VecDeque::new(),
        }
    }

    /// Candidates for `remote` are stale until it starts a new session.
    fn mark_closed(&mut self, remote: &str) {
        self.queues.remove(remote);
        let now = Instant::now();
        self.expire(now);
        if !self.closed.contains_key(remote) && self.closed.len() >= MAX_EARLY_PARTICIPANTS {
            evict_oldest(&mut self.closed, |at| *at);
        }
        self.closed.insert(remote.to_string(), now);
    }

    fn clear(&mut self) {
        self.queues.clear();
        self.closed.clear();
    }
}

impl PeerConnectionManager {
    /// Returns the manager and the receiver its links report on; hand the
    /// receiver to [`PeerConnectionManager::spawn_event_pump`].
    pub fn new(
        cfg: PeerManagerConfig,
        factory: Arc<dyn LinkFactory>,
        media: Arc<dyn MediaSource>,
        renderer: Arc<dyn Renderer>,
        signal_tx: mpsc::Sender<ClientEvent>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mgr = Arc::new(Self {
            cfg,
            factory,
            media,
            renderer,
            signal_tx,
            events_tx,
            slots: StdMutex::new(HashMap::new()),
            early: StdMutex::new(EarlyCandidates::default()),
            local_media: Mutex::new(None),
            next_link: AtomicU64::new(1),
        });
        (mgr, events_rx)
    }

    pub fn local_id(&self) -> &str {
        &self.cfg.local_id
    }

    pub fn room_id(&self) -> &str {
        &self.cfg.room_id
    }

    fn slots(&self) -> StdMutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn early(&self) -> StdMutexGuard<'_, EarlyCandidates> {
        self.early.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, remote: &str) -> Option<Slot> {
        self.slots().get(remote).cloned()
    }

    fn current_link(&self, remote: &str) -> Option<u64> {
        self.slots().get(remote).map(|s| s.link_id)
    }

    /// New locked entry seeded with candidates that arrived before it existed.
    /// Caller must hold the slot map lock.
    fn fresh_slot(&self, remote: &str) -> Option<(Slot, OwnedMutexGuard<PeerEntry>)> {
        let pending = self.early().take(remote);
        let entry = Arc::new(Mutex::new(PeerEntry {
            link: None,
            state: PeerState::Idle,
            remote_set: false,
            pending,
            has_target: false,
        }));
        // Fresh mutex, never contended.
        let guard = entry.clone().try_lock_owned().ok()?;
        let slot = Slot {
            link_id: self.next_link.fetch_add(1, Ordering::Relaxed),
            entry,
        };
        Some((slot, guard))
    }

    fn claim_new(&self, remote: &str) -> Option<(Slot, OwnedMutexGuard<PeerEntry>)> {
        let mut slots = self.slots();
        if slots.contains_key(remote) {
            return None;
        }
        let (slot, guard) = self.fresh_slot(remote)?;
        slots.insert(remote.to_string(), slot.clone());
        Some((slot, guard))
    }

    fn install(&self, remote: &str) -> Option<(Slot, OwnedMutexGuard<PeerEntry>, Option<Slot>)> {
        let mut slots = self.slots();
        let (slot, guard) = self.fresh_slot(remote)?;
        let displaced = slots.insert(remote.to_string(), slot.clone());
        Some((slot, guard, displaced))
    }

    /// Removes the slot, restricted to `link_id` when given.
    fn take_slot(&self, remote: &str, link_id: Option<u64>) -> Option<Slot> {
        let mut slots = self.slots();
        match (slots.get(remote), link_id) {
            (None, _) => None,
            (Some(s), Some(id)) if s.link_id != id => None,
            _ => slots.remove(remote),
        }
    }

    async fn signal(&self, ev: ClientEvent) -> Result<(), PeerError> {
        self.signal_tx.send(ev).await.map_err(|_| PeerError::SignalingClosed)
    }

    /// Requests capture once; later calls share the same tracks. A failure is
    /// not cached, so the next call retries.
    pub async fn acquire_local_media(&self) -> Result<Arc<LocalMedia>, PeerError> {
        let mut guard = self.local_media.lock().await;
        if let Some(media) = guard.as_ref() {
            return Ok(media.clone());
        }
        let media = Arc::new(self.media.acquire().await?);
        info!(tracks = media.tracks().len(), "local media acquired");
        *guard = Some(media.clone());
        Ok(media)
    }

    async fn open_link(&self, remote: &str, link_id: u64, entry: &mut PeerEntry) -> Result<Arc<dyn PeerLink>, PeerError> {
        let media = self.acquire_local_media().await?;
        let link = self.factory.create(remote, link_id, self.events_tx.clone()).await?;
        entry.link = Some(link.clone());
        link.add_tracks(&media).await?;
        Ok(link)
    }

    async fn close_entry(&self, remote: &str, entry: &mut PeerEntry) {
        entry.state = PeerState::Closed;
        entry.remote_set = false;
        entry.pending.clear();
        if let Some(link) = entry.link.take() {
            if let Err(e) = link.close().await {
                warn!(remote, "close connection failed: {e}");
            }
        }
        if entry.has_target {
            entry.has_target = false;
            self.renderer.release(remote).await;
        }
    }

    async fn abandon(&self, remote: &str, link_id: u64, entry: &mut PeerEntry) {
        self.take_slot(remote, Some(link_id));
        self.close_entry(remote, entry).await;
    }

    async fn flush_pending(&self, remote: &str, entry: &mut PeerEntry) {
        let Some(link) = entry.link.clone() else { return };
        let n = entry.pending.len();
        while let Some(c) = entry.pending.pop_front() {
            if let Err(e) = link.add_ice_candidate(c).await {
                warn!(remote, "apply queued candidate failed: {e}");
            }
        }
        if n > 0 {
            debug!(remote, applied = n, "queued candidates applied");
        }
    }

    /// Offers to `remote` unless an entry already exists.
    pub async fn initiate_connection(&self, remote: &str) -> Result<(), PeerError> {
        if remote == self.cfg.local_id {
            return Ok(());
        }
        let Some((slot, mut entry)) = self.claim_new(remote) else {
            debug!(remote, "connection already exists");
            return Ok(());
        };
        let result = self.send_offer(remote, slot.link_id, &mut entry).await;
        if let Err(e) = &result {
            warn!(remote, "initiate failed: {e}");
            self.abandon(remote, slot.link_id, &mut entry).await;
        }
        result
    }

    async fn send_offer(&self, remote: &str, link_id: u64, entry: &mut PeerEntry) -> Result<(), PeerError> {
        let link = self.open_link(remote, link_id, entry).await?;
        let offer = link.create_offer().await?;
        link.set_local_description(offer.clone()).await?;
        entry.state = PeerState::Offering;
        self.signal(ClientEvent::Offer(OfferSignal {
            offer,
            from: self.cfg.local_id.clone(),
            room_id: self.cfg.room_id.clone(),
            to: Some(remote.to_string()),
        }))
        .await?;
        info!(remote, "offer sent");
        Ok(())
    }

    /// Both sides offered: the side whose id sorts last answers.
    fn yields_to(&self, remote: &str) -> bool {
        self.cfg.local_id.as_str() > remote
    }

    pub async fn on_offer_received(&self, remote: &str, offer: SessionDescription) -> Result<(), PeerError> {
        if remote == self.cfg.local_id {
            return Ok(());
        }
        let mut carried = VecDeque::new();
        let mut replaced = None;
        // Held until the new entry is installed, so waiters on the old entry
        // find its successor.
        let mut old_guard = None;
        if let Some(old) = self.slot(remote) {
            let mut old_entry = old.entry.clone().lock_owned().await;
            match old_entry.state {
                PeerState::Offering if !self.yields_to(remote) => {
                    info!(remote, "glare: keeping local offer");
                    return Ok(());
                }
                PeerState::Offering => info!(remote, "glare: yielding to remote offer"),
                PeerState::Answering | PeerState::Connected => {
                    info!(remote, "remote restarted negotiation, replacing connection")
                }
                PeerState::Idle | PeerState::Closed => {}
            }
            carried = std::mem::take(&mut old_entry.pending);
            self.close_entry(remote, &mut old_entry).await;
            replaced = Some(old.link_id);
            old_guard = Some(old_entry);
        }

        let Some((slot, mut entry, displaced)) = self.install(remote) else {
            return Err(PeerError::Negotiation("entry busy".to_string()));
        };
        drop(old_guard);
        if let Some(d) = displaced.filter(|d| Some(d.link_id) != replaced) {
            let mut e = d.entry.lock().await;
            self.close_entry(remote, &mut e).await;
        }
        if !carried.is_empty() {
            let early = std::mem::take(&mut entry.pending);
            for c in carried.into_iter().chain(early) {
                push_bounded(&mut entry.pending, c, self.cfg.candidate_queue, remote);
            }
        }

        let result = self.send_answer(remote, slot.link_id, &mut entry, offer).await;
        if let Err(e) = &result {
            warn!(remote, "answer failed: {e}");
            self.abandon(remote, slot.link_id, &mut entry).await;
        }
        result
    }

    async fn send_answer(
        &self,
        remote: &str,
        link_id: u64,
        entry: &mut PeerEntry,
        offer: SessionDescription,
    ) -> Result<(), PeerError> {
        let link = self.open_link(remote, link_id, entry).await?;
        link.set_remote_description(offer).await?;
        entry.remote_set = true;
        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        self.signal(ClientEvent::Answer(AnswerSignal {
            answer,
            from: self.cfg.local_id.clone(),
            room_id: self.cfg.room_id.clone(),
            to: Some(remote.to_string()),
        }))
        .await?;
        entry.state = PeerState::Answering;
        info!(remote, "answer sent");
        self.flush_pending(remote, entry).await;
        Ok(())
    }

    pub async fn on_answer_received(&self, remote: &str, answer: SessionDescription) -> Result<(), PeerError> {
        let Some(slot) = self.slot(remote) else {
            debug!(remote, "stale answer dropped: no connection");
            return Ok(());
        };
        let mut entry = slot.entry.lock().await;
        if entry.state != PeerState::Offering {
            debug!(remote, state = ?entry.state, "stale answer dropped");
            return Ok(());
        }
        let Some(link) = entry.link.clone() else {
            return Ok(());
        };
        if let Err(e) = link.set_remote_description(answer).await {
            warn!(remote, "apply answer failed: {e}");
            self.abandon(remote, slot.link_id, &mut entry).await;
            return Err(e);
        }
        entry.remote_set = true;
        entry.state = PeerState::Connected;
        info!(remote, "answer applied");
        self.flush_pending(remote, &mut entry).await;
        Ok(())
    }

    pub async fn on_candidate_received(&self, remote: &str, candidate: IceCandidate) -> Result<(), PeerError> {
        loop {
            let slot = {
                let slots = self.slots();
                match slots.get(remote) {
                    Some(s) => s.clone(),
                    None => {
                        self.early().push(remote, candidate, self.cfg.candidate_queue);
                        return Ok(());
                    }
                }
            };
            let mut entry = slot.entry.lock().await;
            if entry.state == PeerState::Closed {
                // Replaced while we waited: retry against the new entry.
                if self.current_link(remote).is_some_and(|id| id != slot.link_id) {
                    continue;
                }
                debug!(remote, "candidate dropped: connection closed");
                return Ok(());
            }
            if !entry.remote_set {
                push_bounded(&mut entry.pending, candidate, self.cfg.candidate_queue, remote);
                return Ok(());
            }
            if let Some(link) = entry.link.clone() {
                if let Err(e) = link.add_ice_candidate(candidate).await {
                    warn!(remote, "apply candidate failed: {e}");
                }
            }
            return Ok(());
        }
    }

    pub async fn on_remote_track_arrived(&self, remote: &str, track: RemoteTrack) {
        let Some(slot) = self.slot(remote) else {
            debug!(remote, "track for unknown participant ignored");
            return;
        };
        let mut entry = slot.entry.lock().await;
        if entry.state == PeerState::Closed {
            return;
        }
        if !entry.has_target {
            self.renderer.create_target(remote).await;
            entry.has_target = true;
        }
        info!(remote, track = %track.id, kind = ?track.kind, "remote track attached");
        self.renderer.attach(remote, track).await;
    }

    /// Closes and forgets the connection to `remote`. Safe to repeat.
    pub async fn on_peer_disconnected(&self, remote: &str) {
        self.disconnect(remote, None).await;
    }

    async fn disconnect(&self, remote: &str, link_id: Option<u64>) {
        let slot = self.take_slot(remote, link_id);
        let Some(slot) = slot else { return };
        self.early().mark_closed(remote);
        let mut entry = slot.entry.lock().await;
        self.close_entry(remote, &mut entry).await;
        info!(remote, "peer disconnected");
    }

    /// Closes every connection and releases capture. Safe to repeat.
    pub async fn leave_room(&self) {
        let slots: Vec<(String, Slot)> = self.slots().drain().collect();
        self.early().clear();
        for (remote, slot) in slots {
            let mut entry = slot.entry.lock().await;
            self.close_entry(&remote, &mut entry).await;
        }
        if let Some(media) = self.local_media.lock().await.take() {
            media.release();
            info!("local media released");
        }
    }

    pub async fn state_of(&self, remote: &str) -> Option<PeerState> {
        let slot = self.slot(remote)?;
        let entry = slot.entry.lock().await;
        Some(entry.state)
    }

    pub fn participants(&self) -> Vec<String> {
        let mut out: Vec<String> = self.slots().keys().cloned().collect();
        out.sort();
        out
    }

    pub async fn handle_link_event(&self, ev: LinkEvent) {
        if self.current_link(&ev.remote) != Some(ev.link_id) {
            debug!(remote = %ev.remote, link = ev.link_id, "event from replaced connection ignored");
            return;
        }
        match ev.kind {
            LinkEventKind::LocalCandidate(candidate) => {
                let out = ClientEvent::Candidate(CandidateSignal {
                    candidate,
                    from: self.cfg.local_id.clone(),
                    room_id: self.cfg.room_id.clone(),
                    to: Some(ev.remote.clone()),
                });
                if self.signal(out).await.is_err() {
                    warn!(remote = %ev.remote, "local candidate not sent: signaling closed");
                }
            }
            LinkEventKind::RemoteTrack(track) => self.on_remote_track_arrived(&ev.remote, track).await,
            LinkEventKind::StateChanged(state) => match state {
                LinkState::Connected => {
                    let Some(slot) = self.slot(&ev.remote) else { return };
                    let mut entry = slot.entry.lock().await;
                    if entry.state == PeerState::Answering {
                        entry.state = PeerState::Connected;
                    }
                    info!(remote = %ev.remote, "connection established");
                }
                LinkState::Disconnected | LinkState::Failed | LinkState::Closed => {
                    info!(remote = %ev.remote, state = ?state, "connection lost");
                    self.disconnect(&ev.remote, Some(ev.link_id)).await;
                }
                LinkState::New | LinkState::Connecting => {}
            },
        }
    }

    /// Drives link callbacks into the manager until the manager is dropped.
    pub fn spawn_event_pump(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<LinkEvent>) -> JoinHandle<()> {
        let mgr: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                let Some(mgr) = mgr.upgrade() else { break };
                mgr.handle_link_event(ev).await;
            }
        })
    }
}
