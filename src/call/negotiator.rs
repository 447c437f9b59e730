//! Offer/answer orchestration
//!
//! Interprets relayed messages and drives the matching transport session:
//!
//! 1. messages authored by the local participant are echoes and are dropped
//! 2. an offer starts the call if needed, is applied to the responder
//!    session, and the resulting answer is relayed back
//! 3. an answer is applied to the initiator session
//! 4. candidates go to the session opposite the role that emitted them
//! 5. anything else is logged and dropped
//!
//! Errors returned here are per-message; the caller decides whether they are
//! fatal (see [`CallError::is_recoverable`]).

use tracing::{debug, info, warn};

use super::lifecycle::CallManager;
use super::CallEvent;
use crate::error::CallError;
use crate::protocol::{
    IceCandidate, NegotiationRole, ParticipantId, RoomId, SdpType, SignalingMessage,
};
use crate::signaling::Relay;
use crate::transport::{SessionEvent, TransportEvent};

/// What handling an inbound message did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Authored by this participant
    SelfEcho,
    /// Offer applied and answer relayed
    Answered,
    /// Answer applied
    AnswerApplied,
    /// Candidates handed to a session (applied or queued)
    Candidates { accepted: usize, rejected: usize },
    /// Not addressed to this call or not understood
    Ignored,
}

/// Drives the offer/answer exchange for one participant in one room
pub struct Negotiator<R: Relay> {
    local_id: ParticipantId,
    room_id: RoomId,
    relay: R,
}

impl<R: Relay> Negotiator<R> {
    pub fn new(local_id: ParticipantId, room_id: &str, relay: R) -> Self {
        Self {
            local_id,
            room_id: room_id.to_string(),
            relay,
        }
    }

    pub fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn relay_mut(&mut self) -> &mut R {
        &mut self.relay
    }

    /// Start a call in `role`, relaying the offer when initiating
    pub async fn start_call(
        &mut self,
        calls: &mut CallManager,
        role: NegotiationRole,
    ) -> Result<(), CallError> {
        if let Some(offer) = calls.start_call(role).await? {
            info!("Relaying offer to room {}", self.room_id);
            self.relay
                .relay(SignalingMessage::with_description(
                    &self.room_id,
                    self.local_id,
                    offer,
                ))
                .await?;
        }
        Ok(())
    }

    /// Handle one relayed message
    pub async fn handle_message(
        &mut self,
        calls: &mut CallManager,
        msg: SignalingMessage,
    ) -> Result<Disposition, CallError> {
        if msg.participant_id == self.local_id {
            return Ok(Disposition::SelfEcho);
        }
        if msg.room_id != self.room_id {
            debug!("Ignoring message for room {}", msg.room_id);
            return Ok(Disposition::Ignored);
        }

        match (msg.description, msg.candidates) {
            (Some(desc), _) if desc.sdp_type == SdpType::Offer => {
                info!("Received offer from {}", msg.participant_id);
                let answer = calls.accept_offer(desc).await?;
                self.relay
                    .relay(SignalingMessage::with_description(
                        &self.room_id,
                        self.local_id,
                        answer,
                    ))
                    .await?;
                Ok(Disposition::Answered)
            }
            (Some(desc), _) => {
                info!("Received answer from {}", msg.participant_id);
                calls.accept_answer(desc).await?;
                Ok(Disposition::AnswerApplied)
            }
            (None, Some(candidates)) if !candidates.is_empty() => {
                // Without an origin the sender is assumed to be the initiator
                let target = msg
                    .origin
                    .unwrap_or(NegotiationRole::Initiator)
                    .opposite();
                self.apply_candidates(calls, target, candidates).await
            }
            _ => {
                warn!("Unknown message from {}", msg.participant_id);
                Ok(Disposition::Ignored)
            }
        }
    }

    async fn apply_candidates(
        &mut self,
        calls: &mut CallManager,
        target: NegotiationRole,
        candidates: Vec<IceCandidate>,
    ) -> Result<Disposition, CallError> {
        let session = calls.ensure_call()?.session_mut(target);

        let mut accepted = 0;
        let mut rejected = 0;
        for candidate in candidates {
            match session.add_ice_candidate(candidate).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    warn!("Dropping candidate for {} session: {}", target, e);
                    rejected += 1;
                }
            }
        }

        Ok(Disposition::Candidates { accepted, rejected })
    }

    /// Handle an event pushed by one of the call's transport sessions
    ///
    /// Local candidates are relayed to the peer; a newly seen remote stream
    /// is reported to the caller.
    pub async fn handle_session_event(
        &mut self,
        calls: &mut CallManager,
        event: SessionEvent,
    ) -> Result<Option<CallEvent>, CallError> {
        let SessionEvent { role, event } = event;

        let open = calls
            .state(role)
            .is_some_and(|state| !state.is_closed());
        if !open {
            debug!("Dropping {} event for closed session", role);
            return Ok(None);
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                debug!("Relaying {} candidate {}", role, candidate.payload);
                self.relay
                    .relay(SignalingMessage::with_candidate(
                        &self.room_id,
                        self.local_id,
                        role,
                        candidate,
                    ))
                    .await?;
                Ok(None)
            }
            TransportEvent::RemoteStream(stream) => {
                if calls.accept_remote_stream(role, stream.clone())? {
                    Ok(Some(CallEvent::RemoteStreamReady {
                        url: stream.to_url(),
                    }))
                } else {
                    Ok(None)
                }
            }
            TransportEvent::ConnectionState(state) => {
                info!("{} session connection {:?}", role, state);
                Ok(None)
            }
        }
    }
}
