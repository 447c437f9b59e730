//! Signaling message definitions
//!
//! Wire format of a relayed message (JSON):
//! - `roomId`: room the message is scoped to
//! - `participantId`: numeric id of the author
//! - `description`: `{ "type": "offer" | "answer", "payload": "<sdp>" }`
//! - `candidates`: list of `{ "payload": "<candidate>" }`
//!
//! Descriptions and candidates travel as separate messages. Candidate
//! messages may carry `origin`, the role of the session that emitted them.
//!
//! Frames exchanged with the relay wrap messages as
//! `{ "event": "join" | "joined" | "message" | "error", "data": ... }`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// Room key scoping relayed messages to one conversation
pub type RoomId = String;

/// Identifies which endpoint authored a relayed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl ParticipantId {
    /// Generate a process-unique id from the wall clock (milliseconds) with a
    /// random suffix so two endpoints started in the same millisecond differ
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self(millis * 1000 + rand::random::<u64>() % 1000)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which half of the offer/answer exchange an endpoint performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationRole {
    /// Creates the offer
    Initiator,
    /// Creates the answer
    Responder,
}

impl NegotiationRole {
    /// The role the far side plays in the same negotiation
    pub fn opposite(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

impl fmt::Display for NegotiationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Responder => write!(f, "responder"),
        }
    }
}

/// Session description types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An offer or answer produced by one transport session for its peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub payload: String,
}

impl SessionDescription {
    pub fn offer(payload: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            payload: payload.into(),
        }
    }

    pub fn answer(payload: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            payload: payload.into(),
        }
    }
}

/// A network path a transport may use to reach its peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub payload: String,
}

impl IceCandidate {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// A message relayed between the two participants of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<IceCandidate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<NegotiationRole>,
}

impl SignalingMessage {
    /// A message carrying an offer or answer
    pub fn with_description(
        room_id: &str,
        participant_id: ParticipantId,
        description: SessionDescription,
    ) -> Self {
        Self {
            room_id: room_id.to_string(),
            participant_id,
            description: Some(description),
            candidates: None,
            origin: None,
        }
    }

    /// A message carrying one locally discovered candidate
    pub fn with_candidate(
        room_id: &str,
        participant_id: ParticipantId,
        origin: NegotiationRole,
        candidate: IceCandidate,
    ) -> Self {
        Self {
            room_id: room_id.to_string(),
            participant_id,
            description: None,
            candidates: Some(vec![candidate]),
            origin: Some(origin),
        }
    }
}

/// Control message sent once when a channel joins a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMessage {
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
}

/// Frames exchanged between a channel and the relay server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum RelayFrame {
    // Client -> Server
    Join(JoinMessage),

    // Server -> Client
    Joined(JoinMessage),
    Error { message: String },

    // Both directions
    Message(SignalingMessage),
}

impl RelayFrame {
    pub fn to_json(&self) -> Result<String, CallError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, CallError> {
        Ok(serde_json::from_str(text)?)
    }
}
