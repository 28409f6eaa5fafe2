/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rooms_protocol::{IceCandidate, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::IceConfig;
use crate::peer::{
    LinkEvent, LinkEventKind, LinkFactory, LinkState, LocalMedia, MediaKind, MediaSource, PeerError, PeerLink,
    RemoteTrack, Renderer,
};

/// One Opus frame of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

fn negotiation(e: webrtc::Error) -> PeerError {
    PeerError::Negotiation(e.to_string())
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => return Err(PeerError::Negotiation("rollback not supported".to_string())),
    }
    .map_err(negotiation)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PeerError::Negotiation("unspecified sdp type".to_string()));
        }
    };
    Ok(SessionDescription { kind, sdp: desc.sdp })
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_candidate(c: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

fn link_state(st: RTCPeerConnectionState) -> LinkState {
    match st {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

fn build_ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    if ice.urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: ice.urls.clone(),
        username: ice.username.clone().unwrap_or_default(),
        credential: ice.credential.clone().unwrap_or_default(),
        ..Default::default()
    }]
}

pub struct RtcLinkFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcLinkFactory {
    pub fn new(ice: &IceConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().context("register codecs")?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).context("register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers: build_ice_servers(ice),
        })
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    async fn create(
        &self,
        remote: &str,
        link_id: u64,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, PeerError> {
        let pc = self
            .api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            })
            .await
            .map_err(negotiation)?;
        let pc = Arc::new(pc);

        {
            let events = events.clone();
            let remote = remote.to_string();
            pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                let events = events.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    let Some(cand) = cand else { return };
                    match cand.to_json() {
                        Ok(init) => {
                            let _ = events.send(LinkEvent {
                                remote,
                                link_id,
                                kind: LinkEventKind::LocalCandidate(from_rtc_candidate(init)),
                            });
                        }
                        Err(e) => warn!(%remote, "local candidate encode failed: {e}"),
                    }
                })
            }));
        }

        {
            let events = events.clone();
            let remote = remote.to_string();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    let kind = if track.kind() == RTPCodecType::Video {
                        MediaKind::Video
                    } else {
                        MediaKind::Audio
                    };
                    let remote_track = RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                        source: Some(track),
                    };
                    let _ = events.send(LinkEvent {
                        remote,
                        link_id,
                        kind: LinkEventKind::RemoteTrack(remote_track),
                    });
                })
            }));
        }

        {
            let remote = remote.to_string();
            pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                let events = events.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    debug!(%remote, link = link_id, state = %st, "peer connection state");
                    let _ = events.send(LinkEvent {
                        remote,
                        link_id,
                        kind: LinkEventKind::StateChanged(link_state(st)),
                    });
                })
            }));
        }

        Ok(Arc::new(RtcPeerLink { pc }))
    }
}

pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn add_tracks(&self, media: &LocalMedia) -> Result<(), PeerError> {
        for track in media.tracks() {
            let sender = self
                .pc
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(negotiation)?;
            // RTCP must be drained for the interceptors to run.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(negotiation)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(negotiation)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(negotiation)
    }
}

/// Opus + VP8 tracks fed by a silent audio clock. Stands in for a camera and
/// microphone on headless hosts.
pub struct SyntheticMediaSource {
    enabled: bool,
    stream_id: String,
}

impl SyntheticMediaSource {
    pub fn new(enabled: bool, stream_id: &str) -> Self {
        Self {
            enabled,
            stream_id: stream_id.to_string(),
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, PeerError> {
        if !self.enabled {
            return Err(PeerError::MediaAccess("capture disabled".to_string()));
        }
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            self.stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_owned(),
            self.stream_id.clone(),
        ));

        let clock = audio.clone();
        let capture = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(20));
            loop {
                tick.tick().await;
                let sample = Sample {
                    data: Bytes::from_static(&OPUS_SILENCE),
                    duration: Duration::from_millis(20),
                    ..Default::default()
                };
                if let Err(e) = clock.write_sample(&sample).await {
                    debug!("write audio sample failed: {e}");
                }
            }
        });
        Ok(LocalMedia::new(vec![audio, video], Some(capture)))
    }
}

/// Drains inbound RTP and logs per-participant throughput.
#[derive(Default)]
pub struct LoggingRenderer {
    readers: StdMutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl LoggingRenderer {
    fn readers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<JoinHandle<()>>>> {
        self.readers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Renderer for LoggingRenderer {
    async fn create_target(&self, participant: &str) {
        self.readers().entry(participant.to_string()).or_default();
        info!(participant, "render target created");
    }

    async fn attach(&self, participant: &str, track: RemoteTrack) {
        let Some(source) = track.source else {
            return;
        };
        let who = participant.to_string();
        let kind = track.kind;
        let reader = tokio::spawn(async move {
            let mut packets: u64 = 0;
            let mut bytes: u64 = 0;
            loop {
                match source.read_rtp().await {
                    Ok((pkt, _)) => {
                        packets += 1;
                        bytes += pkt.payload.len() as u64;
                        if packets % 500 == 0 {
                            debug!(participant = %who, ?kind, packets, bytes, "inbound media");
                        }
                    }
                    Err(e) => {
                        debug!(participant = %who, ?kind, "inbound media ended: {e}");
                        break;
                    }
                }
            }
        });
        self.readers().entry(participant.to_string()).or_default().push(reader);
    }

    async fn release(&self, participant: &str) {
        if let Some(readers) = self.readers().remove(participant) {
            for r in readers {
                r.abort();
            }
        }
        info!(participant, "render target released");
    }
}
