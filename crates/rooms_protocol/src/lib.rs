/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// SDP role of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// Trickled ICE candidate, same field names the browser `RTCIceCandidateInit` uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedRoom {
    pub room_id: String,
}

/// Chat line as sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSend {
    pub username: String,
    pub room_id: String,
    pub message: String,
}

/// Chat line as delivered to the other room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatDelivery {
    pub by: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferSignal {
    pub offer: SessionDescription,
    pub from: String,
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSignal {
    pub answer: SessionDescription,
    pub from: String,
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSignal {
    pub candidate: IceCandidate,
    pub from: String,
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    Message(ChatSend),
    Offer(OfferSignal),
    Answer(AnswerSignal),
    Candidate(CandidateSignal),
}

impl ClientEvent {
    /// Negotiation kind, `None` for non-signaling frames.
    pub fn signal_kind(&self) -> Option<SignalKind> {
        match self {
            ClientEvent::Offer(_) => Some(SignalKind::Offer),
            ClientEvent::Answer(_) => Some(SignalKind::Answer),
            ClientEvent::Candidate(_) => Some(SignalKind::Candidate),
            ClientEvent::JoinRoom(_) | ClientEvent::Message(_) => None,
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            ClientEvent::JoinRoom(v) => &v.room_id,
            ClientEvent::Message(v) => &v.room_id,
            ClientEvent::Offer(v) => &v.room_id,
            ClientEvent::Answer(v) => &v.room_id,
            ClientEvent::Candidate(v) => &v.room_id,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            ClientEvent::Offer(v) => v.to.as_deref(),
            ClientEvent::Answer(v) => v.to.as_deref(),
            ClientEvent::Candidate(v) => v.to.as_deref(),
            ClientEvent::JoinRoom(_) | ClientEvent::Message(_) => None,
        }
    }
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    JoinedRoom(JoinedRoom),
    Message(ChatDelivery),
    Offer(OfferSignal),
    Answer(AnswerSignal),
    Candidate(CandidateSignal),
    ParticipantJoined(Participant),
    ParticipantLeft(Participant),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_frame_uses_camel_case_fields() {
        let ev = ClientEvent::Message(ChatSend {
            username: "alice".to_string(),
            room_id: "r1".to_string(),
            message: "hi".to_string(),
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            v,
            json!({"event": "message", "data": {"username": "alice", "roomId": "r1", "message": "hi"}})
        );
    }

    #[test]
    fn candidate_frame_parses_browser_shape() {
        let raw = json!({
            "event": "candidate",
            "data": {
                "candidate": {
                    "candidate": "candidate:1 1 UDP 2122260223 10.0.0.2 5000 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                },
                "from": "bob",
                "roomId": "r1",
                "to": "alice"
            }
        });
        let ev: ClientEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(ev.signal_kind(), Some(SignalKind::Candidate));
        assert_eq!(ev.room_id(), "r1");
        assert_eq!(ev.target(), Some("alice"));
        let ClientEvent::Candidate(c) = ev else { panic!("expected candidate") };
        assert_eq!(c.candidate.sdp_mline_index, Some(0));
        assert_eq!(c.candidate.sdp_mid.as_deref(), Some("0"));
    }

    #[test]
    fn offer_without_target_omits_to() {
        let ev = ServerEvent::Offer(OfferSignal {
            offer: SessionDescription { kind: SdpKind::Offer, sdp: "v=0".to_string() },
            from: "alice".to_string(),
            room_id: "r1".to_string(),
            to: None,
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["data"]["offer"]["type"], "offer");
        assert!(v["data"].get("to").is_none());
    }
}
