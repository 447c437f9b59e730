//! Call lifecycle management
//!
//! Owns the local stream and the per-call transport sessions. Only this
//! manager acquires, reassigns or releases the local stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{Facing, MediaConstraints, MediaDevices, MediaStream};
use crate::protocol::{NegotiationRole, RoomId, SessionDescription};
use crate::transport::{SessionEvent, TransportFactory, TransportSession, TransportState};

/// One call: an initiator-role and a responder-role transport session
///
/// Across two devices each endpoint drives only one of the two; both exist so
/// that either role can be taken without rebuilding the call.
pub struct CallSession {
    room_id: RoomId,
    initiator: TransportSession,
    responder: TransportSession,
    remote_stream: Option<MediaStream>,
}

impl CallSession {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn session(&self, role: NegotiationRole) -> &TransportSession {
        match role {
            NegotiationRole::Initiator => &self.initiator,
            NegotiationRole::Responder => &self.responder,
        }
    }

    pub fn session_mut(&mut self, role: NegotiationRole) -> &mut TransportSession {
        match role {
            NegotiationRole::Initiator => &mut self.initiator,
            NegotiationRole::Responder => &mut self.responder,
        }
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    async fn close(&mut self) {
        self.initiator.close().await;
        self.responder.close().await;
        self.remote_stream = None;
    }
}

/// Starts and stops calls and holds the media they share
pub struct CallManager {
    config: CallConfig,
    media: Arc<dyn MediaDevices>,
    transports: Arc<dyn TransportFactory>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
    local_stream: Option<MediaStream>,
    call: Option<CallSession>,
}

impl CallManager {
    /// Create a manager; transport events of every call go to `session_events`
    pub fn new(
        config: CallConfig,
        media: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
        session_events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            config,
            media,
            transports,
            session_events,
            local_stream: None,
            call: None,
        }
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.call.as_ref().and_then(|c| c.remote_stream())
    }

    pub fn call(&self) -> Option<&CallSession> {
        self.call.as_ref()
    }

    pub fn call_mut(&mut self) -> Option<&mut CallSession> {
        self.call.as_mut()
    }

    /// State of the session for `role`, if a call exists
    pub fn state(&self, role: NegotiationRole) -> Option<TransportState> {
        self.call.as_ref().map(|c| c.session(role).state())
    }

    /// A call can be started once local media exists and no peer media arrived yet
    pub fn can_start_call(&self) -> bool {
        self.local_stream.is_some() && self.remote_stream().is_none()
    }

    /// Ending is offered to the user once peer media is showing
    pub fn can_end_call(&self) -> bool {
        self.remote_stream().is_some()
    }

    /// Acquire the local capture stream
    ///
    /// Returns the existing stream if one was already acquired.
    pub async fn start_local(&mut self) -> Result<MediaStream, CallError> {
        if let Some(stream) = &self.local_stream {
            return Ok(stream.clone());
        }

        let devices = self.media.enumerate_devices().await?;
        let constraints = MediaConstraints::for_capture(&self.config.capture, &devices);
        if let Ok(json) = serde_json::to_string(&constraints) {
            debug!("Requesting local media with {}", json);
        }

        let stream = self.media.get_user_media(&constraints).await?;
        info!("Local stream {} ready", stream.id());
        self.local_stream = Some(stream.clone());
        Ok(stream)
    }

    /// Return the live call, building one with fresh transport sessions if needed
    pub fn ensure_call(&mut self) -> Result<&mut CallSession, CallError> {
        let stale = self
            .call
            .as_ref()
            .is_some_and(|c| c.initiator.state().is_closed() && c.responder.state().is_closed());
        if stale {
            self.call = None;
        }

        if self.call.is_none() {
            let stream = self.local_stream.clone().ok_or(CallError::NoLocalStream)?;
            let ice = &self.config.ice_servers;

            let mut initiator = TransportSession::new(
                NegotiationRole::Initiator,
                self.transports.create(ice)?,
                self.session_events.clone(),
            );
            let mut responder = TransportSession::new(
                NegotiationRole::Responder,
                self.transports.create(ice)?,
                self.session_events.clone(),
            );
            initiator.attach_stream(stream.clone())?;
            responder.attach_stream(stream)?;

            info!("Call started in room {}", self.config.room_id);
            self.call = Some(CallSession {
                room_id: self.config.room_id.clone(),
                initiator,
                responder,
                remote_stream: None,
            });
        }

        self.call.as_mut().ok_or(CallError::NoLocalStream)
    }

    /// Start a call in the given role
    ///
    /// As initiator this produces the offer to relay; as responder the call is
    /// prepared and waits for the peer's offer.
    pub async fn start_call(
        &mut self,
        role: NegotiationRole,
    ) -> Result<Option<SessionDescription>, CallError> {
        let call = self.ensure_call()?;
        match role {
            NegotiationRole::Initiator => {
                let offer = call.initiator.create_offer().await?;
                Ok(Some(offer))
            }
            NegotiationRole::Responder => Ok(None),
        }
    }

    /// Apply the peer's offer and produce the answer
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, CallError> {
        let fresh = self.call.as_ref().map_or(true, |c| {
            c.initiator.state().is_closed() && c.responder.state().is_closed()
        });
        let call = self.ensure_call()?;

        // Two-party assumption: the side that already offered does not answer
        let initiator_state = call.initiator.state();
        if initiator_state != TransportState::Idle {
            return Err(CallError::InvalidState {
                operation: "apply remote offer",
                state: format!("initiator {}", initiator_state),
            });
        }

        let result = match call.responder.set_remote_description(offer).await {
            Ok(()) => call.responder.create_answer().await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.discard_responder(fresh).await;
        }
        result.map_err(rejected)
    }

    /// Undo a failed offer: drop a call built only for it, or give the
    /// responder role a new session
    async fn discard_responder(&mut self, fresh: bool) {
        if fresh {
            if let Some(mut call) = self.call.take() {
                call.close().await;
                debug!("Discarded call opened by a rejected offer");
            }
            return;
        }

        let touched = self
            .state(NegotiationRole::Responder)
            .is_some_and(|s| s != TransportState::Idle);
        if !touched {
            return;
        }

        let Some(stream) = self.local_stream.clone() else {
            return;
        };
        let transport = match self.transports.create(&self.config.ice_servers) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Could not rebuild responder session: {}", e);
                return;
            }
        };
        let mut responder = TransportSession::new(
            NegotiationRole::Responder,
            transport,
            self.session_events.clone(),
        );
        if let Err(e) = responder.attach_stream(stream) {
            warn!("Could not rebuild responder session: {}", e);
            return;
        }

        if let Some(call) = self.call.as_mut() {
            let mut previous = std::mem::replace(&mut call.responder, responder);
            previous.close().await;
            debug!("Responder session rebuilt after rejected offer");
        }
    }

    /// Apply the peer's answer to the offer this side made
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        let call = self.call.as_mut().ok_or_else(|| CallError::InvalidState {
            operation: "apply remote answer",
            state: "no call".to_string(),
        })?;
        call.initiator
            .set_remote_description(answer)
            .await
            .map_err(rejected)
    }

    /// Record peer media delivered through the `role` session
    ///
    /// Returns `Ok(true)` the first time a given stream is seen.
    pub fn accept_remote_stream(
        &mut self,
        role: NegotiationRole,
        stream: MediaStream,
    ) -> Result<bool, CallError> {
        let call = self.call.as_mut().ok_or_else(|| CallError::InvalidState {
            operation: "accept remote stream",
            state: "no call".to_string(),
        })?;

        if !call.session_mut(role).accept_remote_stream(stream.clone())? {
            return Ok(false);
        }
        call.remote_stream = Some(stream);
        Ok(true)
    }

    /// Tear down the call and release local media
    ///
    /// Safe with no call in progress. Returns whether anything was released.
    pub async fn end_call(&mut self) -> bool {
        let mut released = false;

        if let Some(mut call) = self.call.take() {
            call.close().await;
            released = true;
        }
        if let Some(stream) = self.local_stream.take() {
            stream.release();
            released = true;
        }

        if released {
            info!("Call ended");
        }
        released
    }

    /// Flip outbound audio; only while peer media is showing
    ///
    /// Returns the new muted state, or `None` if there is nothing to mute.
    pub fn toggle_mute(&self) -> Option<bool> {
        self.remote_stream()?;
        let stream = self.local_stream.as_ref()?;
        let muted = stream.toggle_audio();
        info!("{} local audio", if muted { "Muted" } else { "Unmuted" });
        Some(muted)
    }

    /// Switch the local stream to the other camera
    pub fn switch_camera(&self) -> Option<Facing> {
        let facing = self.local_stream.as_ref()?.switch_camera();
        if let Some(facing) = facing {
            info!("Switched camera to {:?}", facing);
        }
        facing
    }

    pub fn is_muted(&self) -> bool {
        self.local_stream.as_ref().is_some_and(|s| s.is_muted())
    }
}

/// Transport failures on a peer description are the peer's fault, not ours
fn rejected(e: CallError) -> CallError {
    match e {
        CallError::Transport(reason) => CallError::RemoteDescriptionRejected(reason),
        other => other,
    }
}
