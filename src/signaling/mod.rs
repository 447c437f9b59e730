//! Signaling module
//!
//! Relay channel used to bootstrap a call: WebSocket client, relay server and
//! the outbound `Relay` seam the negotiator sends through.

mod client;
mod relay;
mod server;
mod tls;

pub use client::{ChannelEvent, SignalingClient, SignalingConnection};
pub use relay::Relay;
pub use server::{RelayServer, RoomInfo, MAX_PARTICIPANTS_PER_ROOM};
pub use tls::{load_certs, load_private_key, tls_acceptor};
