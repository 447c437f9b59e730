//! Per-call transport session
//!
//! State machine over one platform transport:
//!
//! ```text
//! [*] --> Idle
//! Idle --> LocalOfferSet: create_offer()
//! LocalOfferSet --> RemoteAnswerSet: set_remote_description(answer)
//! Idle --> RemoteOfferSet: set_remote_description(offer)
//! RemoteOfferSet --> LocalAnswerSet: create_answer()
//! any --> Closed: close()
//! ```
//!
//! A session is built for exactly one call and never reused.

use std::fmt;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::candidate_queue::{CandidateQueue, Enqueued};
use super::{MediaTransport, TransportEvent};
use crate::error::CallError;
use crate::media::MediaStream;
use crate::protocol::{IceCandidate, NegotiationRole, SdpType, SessionDescription};

/// Negotiation state of a transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Idle,
    LocalOfferSet,
    RemoteOfferSet,
    RemoteAnswerSet,
    LocalAnswerSet,
    /// Terminal; resources released
    Closed,
}

impl TransportState {
    /// Check if the remote description has been applied
    pub fn has_remote_description(&self) -> bool {
        matches!(
            self,
            Self::RemoteOfferSet | Self::RemoteAnswerSet | Self::LocalAnswerSet
        )
    }

    /// Check if both descriptions are set
    pub fn is_negotiated(&self) -> bool {
        matches!(self, Self::RemoteAnswerSet | Self::LocalAnswerSet)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A transport event tagged with the session it came from
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub role: NegotiationRole,
    pub event: TransportEvent,
}

/// One call's view of a platform transport
pub struct TransportSession {
    role: NegotiationRole,
    state: TransportState,
    transport: Box<dyn MediaTransport>,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    candidates: CandidateQueue,
    /// Forwards transport events to the owner until close
    event_handle: Option<JoinHandle<()>>,
}

impl TransportSession {
    /// Create a session and subscribe to its transport's events
    ///
    /// Events are forwarded, tagged with `role`, to `events` until the session
    /// is closed. Must be called within a tokio runtime.
    pub fn new(
        role: NegotiationRole,
        mut transport: Box<dyn MediaTransport>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let event_handle = transport.take_events().map(|mut rx| {
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if events.send(SessionEvent { role, event }).is_err() {
                        break;
                    }
                }
            })
        });

        Self {
            role,
            state: TransportState::Idle,
            transport,
            local_stream: None,
            remote_stream: None,
            local_description: None,
            remote_description: None,
            candidates: CandidateQueue::new(),
            event_handle,
        }
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    /// Number of candidates waiting for the remote description
    pub fn queued_candidates(&self) -> usize {
        self.candidates.len()
    }

    fn invalid(&self, operation: &'static str) -> CallError {
        CallError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }

    /// Attach the local media stream
    pub fn attach_stream(&mut self, stream: MediaStream) -> Result<(), CallError> {
        if self.state.is_closed() {
            return Err(self.invalid("attach stream"));
        }
        if self.local_stream.as_ref() == Some(&stream) {
            return Ok(());
        }

        self.transport.add_stream(&stream);
        debug!("{} session attached stream {}", self.role, stream.id());
        self.local_stream = Some(stream);
        Ok(())
    }

    /// Produce an offer and apply it locally
    pub async fn create_offer(&mut self) -> Result<SessionDescription, CallError> {
        if self.state != TransportState::Idle {
            return Err(self.invalid("create offer"));
        }
        if self.local_stream.is_none() {
            return Err(CallError::NoLocalStream);
        }

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(&offer).await?;

        self.local_description = Some(offer.clone());
        self.state = TransportState::LocalOfferSet;
        info!("{} session: local offer set", self.role);
        Ok(offer)
    }

    /// Apply the peer's offer or answer
    pub async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), CallError> {
        let (operation, next) = match desc.sdp_type {
            SdpType::Offer => ("apply remote offer", TransportState::RemoteOfferSet),
            SdpType::Answer => ("apply remote answer", TransportState::RemoteAnswerSet),
        };

        let allowed = matches!(
            (desc.sdp_type, self.state),
            (SdpType::Offer, TransportState::Idle) | (SdpType::Answer, TransportState::LocalOfferSet)
        );
        if !allowed {
            return Err(self.invalid(operation));
        }

        self.transport.set_remote_description(&desc).await?;
        self.remote_description = Some(desc);
        self.state = next;
        info!("{} session: {:?}", self.role, next);

        self.candidates.drain(self.transport.as_mut()).await;
        Ok(())
    }

    /// Produce an answer to the applied remote offer
    pub async fn create_answer(&mut self) -> Result<SessionDescription, CallError> {
        if self.state != TransportState::RemoteOfferSet {
            return Err(self.invalid("create answer"));
        }

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(&answer).await?;

        self.local_description = Some(answer.clone());
        self.state = TransportState::LocalAnswerSet;
        info!("{} session: local answer set", self.role);

        self.candidates.drain(self.transport.as_mut()).await;
        Ok(answer)
    }

    /// Apply a peer candidate, or queue it until the remote description exists
    pub async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        if self.state.is_closed() {
            return Err(self.invalid("add ICE candidate"));
        }

        let candidate = if self.state.has_remote_description() {
            candidate
        } else {
            match self.candidates.enqueue(candidate) {
                Enqueued::Buffered => return Ok(()),
                Enqueued::Forward(candidate) => candidate,
            }
        };

        self.transport
            .add_ice_candidate(&candidate)
            .await
            .map_err(|e| match e {
                CallError::CandidateApplyFailed(_) => e,
                other => CallError::CandidateApplyFailed(other.to_string()),
            })
    }

    /// Record media received from the peer
    ///
    /// Returns `Ok(false)` for a stream that was already recorded.
    pub fn accept_remote_stream(&mut self, stream: MediaStream) -> Result<bool, CallError> {
        if self.state.is_closed() || !self.state.has_remote_description() {
            return Err(self.invalid("accept remote stream"));
        }
        if self.remote_stream.as_ref() == Some(&stream) {
            return Ok(false);
        }

        info!("{} session received remote stream {}", self.role, stream.id());
        self.remote_stream = Some(stream);
        Ok(true)
    }

    /// Tear down the session; repeat calls are no-ops
    pub async fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }

        if let Some(handle) = self.event_handle.take() {
            handle.abort();
        }

        if self.local_stream.take().is_some() {
            self.transport.remove_stream();
        }
        self.remote_stream = None;
        self.candidates.clear();
        self.transport.close().await;

        let previous = self.state;
        self.state = TransportState::Closed;
        info!("{} session closed (was {})", self.role, previous);
    }

    /// Check if the event subscription is still registered
    pub fn is_subscribed(&self) -> bool {
        self.event_handle.is_some()
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(handle) = self.event_handle.take() {
            warn!("{} session dropped without close", self.role);
            handle.abort();
        }
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("queued_candidates", &self.candidates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Facing, MediaTrack};
    use crate::transport::LoopbackTransport;

    fn session(role: NegotiationRole) -> (TransportSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Box::new(LoopbackTransport::new(&[]));
        (TransportSession::new(role, transport, tx), rx)
    }

    fn stream() -> MediaStream {
        MediaStream::new(vec![
            MediaTrack::audio(None),
            MediaTrack::video(Facing::Environment, None),
        ])
    }

    #[tokio::test]
    async fn test_offer_requires_stream() {
        let (mut session, _rx) = session(NegotiationRole::Initiator);
        let result = session.create_offer().await;
        assert!(matches!(result, Err(CallError::NoLocalStream)));
        assert_eq!(session.state(), TransportState::Idle);
    }

    #[tokio::test]
    async fn test_offer_twice_rejected() {
        let (mut session, _rx) = session(NegotiationRole::Initiator);
        session.attach_stream(stream()).unwrap();

        let offer = session.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert_eq!(session.state(), TransportState::LocalOfferSet);

        let second = session.create_offer().await;
        assert!(matches!(second, Err(CallError::InvalidState { .. })));
        assert_eq!(session.state(), TransportState::LocalOfferSet);
    }

    #[tokio::test]
    async fn test_offer_after_remote_offer_rejected() {
        let (mut initiator, _a) = session(NegotiationRole::Initiator);
        let (mut responder, _b) = session(NegotiationRole::Responder);
        initiator.attach_stream(stream()).unwrap();
        responder.attach_stream(stream()).unwrap();

        let offer = initiator.create_offer().await.unwrap();
        responder.set_remote_description(offer).await.unwrap();

        assert!(responder.create_offer().await.is_err());
        assert_eq!(responder.state(), TransportState::RemoteOfferSet);
    }

    #[tokio::test]
    async fn test_answer_in_idle_rejected() {
        let (mut session, _rx) = session(NegotiationRole::Initiator);
        let result = session
            .set_remote_description(SessionDescription::answer("v=0"))
            .await;

        assert!(matches!(result, Err(CallError::InvalidState { .. })));
        assert_eq!(session.state(), TransportState::Idle);
        assert!(session.remote_description().is_none());
    }

    #[tokio::test]
    async fn test_create_answer_requires_remote_offer() {
        let (mut session, _rx) = session(NegotiationRole::Responder);
        assert!(session.create_answer().await.is_err());
        assert_eq!(session.state(), TransportState::Idle);
    }

    #[tokio::test]
    async fn test_full_exchange() {
        let (mut initiator, _a) = session(NegotiationRole::Initiator);
        let (mut responder, _b) = session(NegotiationRole::Responder);
        initiator.attach_stream(stream()).unwrap();
        responder.attach_stream(stream()).unwrap();

        let offer = initiator.create_offer().await.unwrap();
        responder.set_remote_description(offer).await.unwrap();
        let answer = responder.create_answer().await.unwrap();
        assert_eq!(responder.state(), TransportState::LocalAnswerSet);

        initiator.set_remote_description(answer.clone()).await.unwrap();
        assert_eq!(initiator.state(), TransportState::RemoteAnswerSet);

        // Duplicate delivery of the same answer
        let duplicate = initiator.set_remote_description(answer).await;
        assert!(matches!(duplicate, Err(CallError::InvalidState { .. })));
        assert_eq!(initiator.state(), TransportState::RemoteAnswerSet);
    }

    #[tokio::test]
    async fn test_candidate_queued_until_offer() {
        let (mut initiator, _a) = session(NegotiationRole::Initiator);
        let (mut responder, _b) = session(NegotiationRole::Responder);
        initiator.attach_stream(stream()).unwrap();

        responder
            .add_ice_candidate(IceCandidate::new(
                "candidate:1 1 UDP 2122252543 127.0.0.1 50000 typ host",
            ))
            .await
            .unwrap();
        assert_eq!(responder.queued_candidates(), 1);

        let offer = initiator.create_offer().await.unwrap();
        responder.set_remote_description(offer).await.unwrap();
        assert_eq!(responder.queued_candidates(), 0);
    }

    #[tokio::test]
    async fn test_malformed_candidate_fails() {
        let (mut initiator, _a) = session(NegotiationRole::Initiator);
        let (mut responder, _b) = session(NegotiationRole::Responder);
        initiator.attach_stream(stream()).unwrap();

        let offer = initiator.create_offer().await.unwrap();
        responder.set_remote_description(offer).await.unwrap();

        let result = responder
            .add_ice_candidate(IceCandidate::new("not a candidate"))
            .await;
        assert!(matches!(result, Err(CallError::CandidateApplyFailed(_))));
        assert_eq!(responder.state(), TransportState::RemoteOfferSet);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut session, _rx) = session(NegotiationRole::Initiator);
        session.attach_stream(stream()).unwrap();
        session.create_offer().await.unwrap();

        session.close().await;
        assert_eq!(session.state(), TransportState::Closed);
        assert!(session.local_stream().is_none());
        assert!(!session.is_subscribed());

        session.close().await;
        assert_eq!(session.state(), TransportState::Closed);
        assert!(session.local_stream().is_none());
        assert!(!session.is_subscribed());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_everything() {
        let (mut session, _rx) = session(NegotiationRole::Responder);
        session.close().await;

        assert!(session.attach_stream(stream()).is_err());
        assert!(session
            .set_remote_description(SessionDescription::offer("v=0"))
            .await
            .is_err());
        assert!(session
            .add_ice_candidate(IceCandidate::new("candidate:1"))
            .await
            .is_err());
        assert_eq!(session.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_remote_stream_requires_remote_description() {
        let (mut session, _rx) = session(NegotiationRole::Initiator);
        assert!(session.accept_remote_stream(stream()).is_err());
    }
}
