//! Signaling wire schema
//!
//! Every message over the rendezvous connection is
//! `{ "event": <name>, "payload": { ...event specific fields... } }`.

use serde::{Deserialize, Serialize};

use crate::error::SignalingError;
use crate::model::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    JoinRoom,
    ExistingPeers,
    PeerJoined,
    PeerLeft,
    Offer,
    Answer,
    Candidate,
    #[serde(other)]
    Unknown,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::JoinRoom => "join_room",
            Event::ExistingPeers => "existing_peers",
            Event::PeerJoined => "peer_joined",
            Event::PeerLeft => "peer_left",
            Event::Offer => "offer",
            Event::Answer => "answer",
            Event::Candidate => "candidate",
            Event::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// `{type, sdp}`, the shape browsers and pion use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index: Some(0),
            sdp_mid: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub event: Event,
    #[serde(default)]
    pub payload: Payload,
}

/// The events a peer reacts to, with their required fields checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    ExistingPeers(Vec<PeerId>),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Offer {
        source: PeerId,
        sdp: SessionDescription,
    },
    Answer {
        source: PeerId,
        sdp: SessionDescription,
    },
    Candidate {
        source: PeerId,
        candidate: IceCandidate,
    },
}

impl SignalMessage {
    fn new(event: Event, payload: Payload) -> Self {
        Self { event, payload }
    }

    pub fn join_room(room: impl Into<String>) -> Self {
        Self::new(
            Event::JoinRoom,
            Payload {
                room: Some(room.into()),
                ..Default::default()
            },
        )
    }

    pub fn offer(target: &PeerId, sdp: SessionDescription) -> Self {
        Self::new(
            Event::Offer,
            Payload {
                target: Some(target.to_string()),
                sdp: Some(sdp),
                ..Default::default()
            },
        )
    }

    pub fn answer(target: &PeerId, sdp: SessionDescription) -> Self {
        Self::new(
            Event::Answer,
            Payload {
                target: Some(target.to_string()),
                sdp: Some(sdp),
                ..Default::default()
            },
        )
    }

    pub fn candidate(target: &PeerId, candidate: IceCandidate) -> Self {
        Self::new(
            Event::Candidate,
            Payload {
                target: Some(target.to_string()),
                candidate: Some(candidate),
                ..Default::default()
            },
        )
    }

    pub fn existing_peers(peers: &[PeerId]) -> Self {
        Self::new(
            Event::ExistingPeers,
            Payload {
                peers: Some(peers.iter().map(|p| p.to_string()).collect()),
                ..Default::default()
            },
        )
    }

    pub fn peer_joined(peer: &PeerId) -> Self {
        Self::new(
            Event::PeerJoined,
            Payload {
                peer_id: Some(peer.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn peer_left(peer: &PeerId) -> Self {
        Self::new(
            Event::PeerLeft,
            Payload {
                peer_id: Some(peer.to_string()),
                ..Default::default()
            },
        )
    }

    /// The rendezvous server rewrites `target` into `source` when relaying.
    pub fn relayed_from(mut self, source: &PeerId) -> Self {
        self.payload.target = None;
        self.payload.source = Some(source.to_string());
        self
    }

    pub fn with_room(mut self, room: &str) -> Self {
        self.payload.room = Some(room.to_string());
        self
    }

    pub fn target(&self) -> Option<PeerId> {
        self.payload.target.as_deref().map(PeerId::from)
    }

    /// Checks the fields the event needs. `Ok(None)` for events a peer
    /// never consumes (`join_room`, unknown names).
    pub fn into_inbound(self) -> Result<Option<Inbound>, SignalingError> {
        let event = self.event.as_str();
        let p = self.payload;
        let missing = |field| SignalingError::MissingField { event, field };

        let inbound = match self.event {
            Event::ExistingPeers => Inbound::ExistingPeers(
                p.peers
                    .unwrap_or_default()
                    .into_iter()
                    .map(PeerId::from)
                    .collect(),
            ),
            Event::PeerJoined => {
                Inbound::PeerJoined(p.peer_id.ok_or_else(|| missing("peerId"))?.into())
            }
            Event::PeerLeft => Inbound::PeerLeft(p.peer_id.ok_or_else(|| missing("peerId"))?.into()),
            Event::Offer => Inbound::Offer {
                source: p.source.ok_or_else(|| missing("source"))?.into(),
                sdp: p.sdp.ok_or_else(|| missing("sdp"))?,
            },
            Event::Answer => Inbound::Answer {
                source: p.source.ok_or_else(|| missing("source"))?.into(),
                sdp: p.sdp.ok_or_else(|| missing("sdp"))?,
            },
            Event::Candidate => Inbound::Candidate {
                source: p.source.ok_or_else(|| missing("source"))?.into(),
                candidate: p.candidate.ok_or_else(|| missing("candidate"))?,
            },
            Event::JoinRoom | Event::Unknown => return Ok(None),
        };

        Ok(Some(inbound))
    }
}
