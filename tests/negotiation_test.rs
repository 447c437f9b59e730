//! Negotiation flow tests
//!
//! Two participants wired back to back through in-memory relays: each side's
//! outbound messages are delivered to the other by the test, so message order
//! and duplication are under the test's control.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use duocall::call::{CallEvent, CallManager, Disposition, Negotiator};
use duocall::config::CallConfig;
use duocall::media::FakeMediaDevices;
use duocall::protocol::{
    IceCandidate, NegotiationRole, ParticipantId, SdpType, SessionDescription,
    SignalingMessage,
};
use duocall::transport::{LoopbackFactory, SessionEvent, TransportEvent, TransportState};
use duocall::CallError;

const ROOM: &str = "only_me";

struct Participant {
    negotiator: Negotiator<mpsc::UnboundedSender<SignalingMessage>>,
    calls: CallManager,
    outbox: mpsc::UnboundedReceiver<SignalingMessage>,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Participant {
    async fn with_local_media(id: u64) -> Self {
        let (relay, outbox) = mpsc::unbounded_channel();
        let (events_tx, session_events) = mpsc::unbounded_channel();
        let mut calls = CallManager::new(
            CallConfig::default(),
            Arc::new(FakeMediaDevices::new()),
            Arc::new(LoopbackFactory),
            events_tx,
        );
        calls.start_local().await.expect("Local media unavailable");

        Self {
            negotiator: Negotiator::new(ParticipantId(id), ROOM, relay),
            calls,
            outbox,
            session_events,
        }
    }

    async fn start_call(&mut self, role: NegotiationRole) -> Result<(), CallError> {
        self.negotiator.start_call(&mut self.calls, role).await
    }

    async fn receive(&mut self, msg: SignalingMessage) -> Result<Disposition, CallError> {
        self.negotiator.handle_message(&mut self.calls, msg).await
    }

    fn sent(&mut self) -> Vec<SignalingMessage> {
        let mut sent = Vec::new();
        while let Ok(msg) = self.outbox.try_recv() {
            sent.push(msg);
        }
        sent
    }

    /// Feed pending transport events through the negotiator
    async fn pump_session_events(&mut self) -> Vec<CallEvent> {
        let mut published = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), self.session_events.recv()).await
        {
            if let Some(event) = self
                .negotiator
                .handle_session_event(&mut self.calls, event)
                .await
                .expect("Session event failed")
            {
                published.push(event);
            }
        }
        published
    }

    fn state(&self, role: NegotiationRole) -> Option<TransportState> {
        self.calls.state(role)
    }
}

fn descriptions(msgs: &[SignalingMessage], sdp_type: SdpType) -> usize {
    msgs.iter()
        .filter(|m| m.description.as_ref().is_some_and(|d| d.sdp_type == sdp_type))
        .count()
}

/// Test: Offer/answer exchange
/// Given two participants with local media
/// When the initiator starts the call and each message is delivered once
/// Then exactly one offer and one answer are sent and both sessions reach their negotiated states
#[tokio::test]
async fn test_offer_answer_exchange() {
    let mut alice = Participant::with_local_media(1).await;
    let mut bob = Participant::with_local_media(2).await;

    assert_ok!(alice.start_call(NegotiationRole::Initiator).await);
    assert_eq!(alice.state(NegotiationRole::Initiator), Some(TransportState::LocalOfferSet));
    let from_alice = alice.sent();
    assert_eq!(from_alice.len(), 1);
    assert_eq!(descriptions(&from_alice, SdpType::Offer), 1);
    assert_eq!(from_alice[0].room_id, ROOM);

    let offer = from_alice[0].clone();
    assert_eq!(assert_ok!(bob.receive(offer).await), Disposition::Answered);
    assert_eq!(bob.state(NegotiationRole::Responder), Some(TransportState::LocalAnswerSet));
    let from_bob = bob.sent();
    assert_eq!(from_bob.len(), 1);
    assert_eq!(descriptions(&from_bob, SdpType::Answer), 1);

    let answer = from_bob[0].clone();
    assert_eq!(assert_ok!(alice.receive(answer).await), Disposition::AnswerApplied);
    assert_eq!(
        alice.state(NegotiationRole::Initiator),
        Some(TransportState::RemoteAnswerSet)
    );
}

/// Test: Early candidate is queued until the offer lands
/// Given a responder that has not yet seen the offer
/// When an initiator candidate arrives first
/// Then it is held, and applying the offer drains it without further calls
#[tokio::test]
async fn test_candidate_before_offer_is_queued() {
    let mut alice = Participant::with_local_media(1).await;
    let mut bob = Participant::with_local_media(2).await;

    let early = SignalingMessage::with_candidate(
        ROOM,
        ParticipantId(1),
        NegotiationRole::Initiator,
        IceCandidate::new("candidate:1 1 UDP 2122252543 192.0.2.1 50000 typ host"),
    );
    assert_ok!(bob.receive(early).await);
    assert_eq!(bob.state(NegotiationRole::Responder), Some(TransportState::Idle));
    let queued = bob
        .calls
        .call()
        .map(|c| c.session(NegotiationRole::Responder).queued_candidates());
    assert_eq!(queued, Some(1));

    assert_ok!(alice.start_call(NegotiationRole::Initiator).await);
    let offer = alice.sent().remove(0);
    assert_ok!(bob.receive(offer).await);

    let queued = bob
        .calls
        .call()
        .map(|c| c.session(NegotiationRole::Responder).queued_candidates());
    assert_eq!(queued, Some(0));
}

/// Test: Hang up before the answer
/// Given an initiator waiting for an answer
/// When the call is ended
/// Then the session is gone, local media is released and nothing fails
#[tokio::test]
async fn test_end_call_while_waiting_for_answer() {
    let mut alice = Participant::with_local_media(1).await;
    assert_ok!(alice.start_call(NegotiationRole::Initiator).await);
    let local = alice.calls.local_stream().cloned().expect("No local stream");

    assert!(alice.calls.end_call().await);

    assert!(local.is_released());
    assert!(alice.calls.call().is_none());
    assert!(alice.calls.local_stream().is_none());
    assert!(!alice.calls.end_call().await);
}

/// Test: Duplicate answer from at-least-once relay
/// Given an initiator that has applied the answer
/// When the same answer is delivered again
/// Then it is rejected as out of sequence and the state is unchanged
#[tokio::test]
async fn test_duplicate_answer_rejected() {
    let mut alice = Participant::with_local_media(1).await;
    let mut bob = Participant::with_local_media(2).await;

    assert_ok!(alice.start_call(NegotiationRole::Initiator).await);
    let offer = alice.sent().remove(0);
    assert_ok!(bob.receive(offer).await);
    let answer = bob.sent().remove(0);

    assert_ok!(alice.receive(answer.clone()).await);
    let err = assert_err!(alice.receive(answer).await);

    assert!(matches!(err, CallError::InvalidState { .. }));
    assert!(err.is_recoverable());
    assert_eq!(
        alice.state(NegotiationRole::Initiator),
        Some(TransportState::RemoteAnswerSet)
    );
}

/// Test: Own messages echoed by the relay are ignored
/// Given an initiator that has sent its offer
/// When the relay echoes that offer back
/// Then it is discarded and no session changes state
#[tokio::test]
async fn test_self_echo_discarded() {
    let mut alice = Participant::with_local_media(1).await;
    assert_ok!(alice.start_call(NegotiationRole::Initiator).await);
    let offer = alice.sent().remove(0);

    assert_eq!(assert_ok!(alice.receive(offer).await), Disposition::SelfEcho);
    assert_eq!(alice.state(NegotiationRole::Initiator), Some(TransportState::LocalOfferSet));
    assert_eq!(alice.state(NegotiationRole::Responder), Some(TransportState::Idle));
    assert!(alice.sent().is_empty());
}

/// Test: Echoed answer is ignored
/// Given a responder that has answered an offer
/// When the relay echoes the answer back to it
/// Then it is discarded and neither session moves
#[tokio::test]
async fn test_echoed_answer_discarded() {
    let mut alice = Participant::with_local_media(1).await;
    let mut bob = Participant::with_local_media(2).await;

    assert_ok!(alice.start_call(NegotiationRole::Initiator).await);
    let offer = alice.sent().remove(0);
    assert_ok!(bob.receive(offer).await);
    let answer = bob.sent().remove(0);

    assert_eq!(assert_ok!(bob.receive(answer).await), Disposition::SelfEcho);
    assert_eq!(bob.state(NegotiationRole::Responder), Some(TransportState::LocalAnswerSet));
    assert_eq!(bob.state(NegotiationRole::Initiator), Some(TransportState::Idle));
    assert!(bob.sent().is_empty());
}

/// Test: Echoed candidates are ignored
/// Given a responder relaying its own gathered candidates
/// When the relay echoes one of them back
/// Then it is discarded without being queued or applied
#[tokio::test]
async fn test_echoed_candidate_discarded() {
    let mut alice = Participant::with_local_media(1).await;
    let mut bob = Participant::with_local_media(2).await;

    assert_ok!(alice.start_call(NegotiationRole::Initiator).await);
    let offer = alice.sent().remove(0);
    assert_ok!(bob.receive(offer).await);
    bob.sent();

    let own = SignalingMessage::with_candidate(
        ROOM,
        ParticipantId(2),
        NegotiationRole::Responder,
        IceCandidate::new("candidate:1 1 UDP 2122252543 192.0.2.2 50000 typ host"),
    );
    assert_eq!(assert_ok!(bob.receive(own).await), Disposition::SelfEcho);

    let queued = bob.calls.call().map(|c| {
        (
            c.session(NegotiationRole::Initiator).queued_candidates(),
            c.session(NegotiationRole::Responder).queued_candidates(),
        )
    });
    assert_eq!(queued, Some((0, 0)));
    assert_eq!(bob.state(NegotiationRole::Initiator), Some(TransportState::Idle));
    assert!(bob.sent().is_empty());
}

/// Test: Offer the transport cannot parse
/// Given a participant with local media and no call
/// When an offer with an unusable payload arrives
/// Then it is rejected as recoverable, nothing is relayed and local media is kept
#[tokio::test]
async fn test_malformed_offer_rejected() {
    let mut bob = Participant::with_local_media(2).await;
    let garbage = SignalingMessage::with_description(
        ROOM,
        ParticipantId(1),
        SessionDescription::offer("garbage"),
    );

    let err = assert_err!(bob.receive(garbage).await);

    assert!(matches!(err, CallError::RemoteDescriptionRejected(_)));
    assert!(err.is_recoverable());
    assert!(bob.sent().is_empty());
    assert!(bob.calls.call().is_none());
    assert!(bob.calls.can_start_call());

    // The next good offer is still answered
    let mut alice = Participant::with_local_media(1).await;
    assert_ok!(alice.start_call(NegotiationRole::Initiator).await);
    let offer = alice.sent().remove(0);
    assert_eq!(assert_ok!(bob.receive(offer).await), Disposition::Answered);
}

/// Test: Both sides offer at once
/// Given two participants that each started as initiator
/// When each receives the other's offer
/// Then both offers are rejected and neither side answers
#[tokio::test]
async fn test_simultaneous_offers_rejected() {
    let mut alice = Participant::with_local_media(1).await;
    let mut bob = Participant::with_local_media(2).await;

    assert_ok!(alice.start_call(NegotiationRole::Initiator).await);
    assert_ok!(bob.start_call(NegotiationRole::Initiator).await);
    let alice_offer = alice.sent().remove(0);
    let bob_offer = bob.sent().remove(0);

    assert!(matches!(
        alice.receive(bob_offer).await,
        Err(CallError::InvalidState { .. })
    ));
    assert!(matches!(
        bob.receive(alice_offer).await,
        Err(CallError::InvalidState { .. })
    ));
    assert!(alice.sent().is_empty());
    assert!(bob.sent().is_empty());
}

/// Test: Candidates flow both ways until media arrives
/// Given a completed offer/answer exchange
/// When each side's gathered candidates are relayed to the other
/// Then both sides publish the peer's stream exactly once
#[tokio::test]
async fn test_candidate_exchange_delivers_remote_streams() {
    let mut alice = Participant::with_local_media(1).await;
    let mut bob = Participant::with_local_media(2).await;

    assert_ok!(alice.start_call(NegotiationRole::Initiator).await);
    let offer = alice.sent().remove(0);
    assert_ok!(bob.receive(offer).await);
    let answer = bob.sent().remove(0);
    assert_ok!(alice.receive(answer).await);

    let mut alice_published = Vec::new();
    let mut bob_published = Vec::new();
    for _ in 0..3 {
        alice_published.extend(alice.pump_session_events().await);
        bob_published.extend(bob.pump_session_events().await);

        for msg in alice.sent() {
            assert!(msg.origin == Some(NegotiationRole::Initiator));
            assert_ok!(bob.receive(msg).await);
        }
        for msg in bob.sent() {
            assert!(msg.origin == Some(NegotiationRole::Responder));
            assert_ok!(alice.receive(msg).await);
        }
    }

    let alice_local = alice.calls.local_stream().map(|s| s.to_url());
    let bob_local = bob.calls.local_stream().map(|s| s.to_url());
    assert_eq!(
        alice_published,
        vec![CallEvent::RemoteStreamReady {
            url: bob_local.expect("No local stream")
        }]
    );
    assert_eq!(
        bob_published,
        vec![CallEvent::RemoteStreamReady {
            url: alice_local.expect("No local stream")
        }]
    );
    assert!(alice.calls.toggle_mute().is_some());
}

/// Test: Malformed candidate
/// Given a responder that has applied the offer
/// When a candidate the transport cannot parse arrives
/// Then it is dropped and the session stays negotiated
#[tokio::test]
async fn test_malformed_candidate_dropped() {
    let mut alice = Participant::with_local_media(1).await;
    let mut bob = Participant::with_local_media(2).await;

    assert_ok!(alice.start_call(NegotiationRole::Initiator).await);
    let offer = alice.sent().remove(0);
    assert_ok!(bob.receive(offer).await);

    let bad = SignalingMessage::with_candidate(
        ROOM,
        ParticipantId(1),
        NegotiationRole::Initiator,
        IceCandidate::new("not a candidate"),
    );
    assert_eq!(
        assert_ok!(bob.receive(bad).await),
        Disposition::Candidates {
            accepted: 0,
            rejected: 1
        }
    );
    assert_eq!(bob.state(NegotiationRole::Responder), Some(TransportState::LocalAnswerSet));
}

/// Test: Transport events after hang-up
/// Given a call that has just been ended
/// When a late candidate event from the closed session is handled
/// Then nothing is relayed
#[tokio::test]
async fn test_late_transport_event_ignored() {
    let mut alice = Participant::with_local_media(1).await;
    assert_ok!(alice.start_call(NegotiationRole::Initiator).await);
    alice.sent();
    alice.calls.end_call().await;

    let late = SessionEvent {
        role: NegotiationRole::Initiator,
        event: TransportEvent::LocalCandidate(IceCandidate::new(
            "candidate:1 1 UDP 1 192.0.2.1 1 typ host",
        )),
    };
    let published = assert_ok!(
        alice
            .negotiator
            .handle_session_event(&mut alice.calls, late)
            .await
    );

    assert!(published.is_none());
    assert!(alice.sent().is_empty());
}
