//! Signaling protocol definitions
//!
//! Defines the descriptions, candidates and relay frames exchanged between endpoints.

mod message;

pub use message::{
    IceCandidate, JoinMessage, NegotiationRole, ParticipantId, RelayFrame, RoomId, SdpType,
    SessionDescription, SignalingMessage,
};
