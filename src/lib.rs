//! duocall - Two-party call negotiation over a room-scoped relay
//!
//! This library negotiates a media session between two participants:
//! offer/answer exchange through a signaling relay, queueing of early
//! network candidates, and the lifecycle of the local and remote streams.

pub mod call;
pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod signaling;
pub mod transport;

pub use call::{CallEvent, CallManager, Endpoint, EndpointHandle, Negotiator};
pub use config::CallConfig;
pub use error::CallError;
pub use protocol::{NegotiationRole, ParticipantId, SignalingMessage};
pub use signaling::{RelayServer, SignalingClient};
