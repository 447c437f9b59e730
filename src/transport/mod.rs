//! Transport module
//!
//! Wraps the platform's media-transport capability in per-call sessions that
//! enforce offer/answer ordering and buffer early ICE candidates.

mod candidate_queue;
mod loopback;
mod session;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CallError;
use crate::media::MediaStream;
use crate::protocol::{IceCandidate, SessionDescription};

pub use crate::protocol::NegotiationRole;
pub use candidate_queue::{CandidateQueue, CandidateSink, Enqueued};
pub use loopback::{LoopbackFactory, LoopbackTransport};
pub use session::{SessionEvent, TransportSession, TransportState};

/// Connectivity state reported by a platform transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    New,
    /// Candidates are being gathered and checked
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events a platform transport pushes once negotiation has progressed
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A locally discovered candidate for the peer
    LocalCandidate(IceCandidate),
    /// Media from the peer became available
    RemoteStream(MediaStream),
    /// Connectivity changed
    ConnectionState(ConnectionState),
}

/// Platform media-transport capability (one peer connection)
///
/// Implementations perform SDP generation and ICE; sessions only sequence
/// the calls.
#[async_trait]
pub trait MediaTransport: Send {
    /// Attach the outbound stream
    fn add_stream(&mut self, stream: &MediaStream);

    /// Detach the outbound stream
    fn remove_stream(&mut self);

    async fn create_offer(&mut self) -> Result<SessionDescription, CallError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, CallError>;

    async fn set_local_description(&mut self, desc: &SessionDescription)
        -> Result<(), CallError>;

    async fn set_remote_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<(), CallError>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), CallError>;

    /// Take the event stream; only the first call returns `Some`
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Release the connection; further calls fail
    async fn close(&mut self);
}

/// Builds a fresh transport for every call
pub trait TransportFactory: Send + Sync {
    fn create(&self, ice_servers: &[String]) -> Result<Box<dyn MediaTransport>, CallError>;
}
