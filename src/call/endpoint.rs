//! Endpoint event loop
//!
//! One task owns the call state. User commands, relayed messages and
//! transport events are merged into a single stream and each is handled to
//! completion before the next is taken, so negotiation state needs no locks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::lifecycle::CallManager;
use super::negotiator::Negotiator;
use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{Facing, MediaDevices};
use crate::protocol::{NegotiationRole, ParticipantId, RoomId};
use crate::signaling::{ChannelEvent, Relay, SignalingClient, SignalingConnection};
use crate::transport::{SessionEvent, TransportFactory, TransportState};

const COMMAND_QUEUE_SIZE: usize = 32;
const EVENT_CHANNEL_SIZE: usize = 64;

/// Notifications for the rendering surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    LocalStreamReady { url: String },
    RemoteStreamReady { url: String },
    StreamsClosed,
    MuteChanged { muted: bool },
    CameraSwitched { facing: Facing },
    CallFailed { reason: String },
}

/// Joins a room on the signaling channel
#[async_trait]
pub trait SignalingConnector: Send + 'static {
    type Relay: Relay + 'static;

    async fn join(
        &mut self,
        room_id: &str,
        participant_id: ParticipantId,
    ) -> Result<(Self::Relay, mpsc::UnboundedReceiver<ChannelEvent>), CallError>;
}

#[async_trait]
impl SignalingConnector for SignalingClient {
    type Relay = SignalingConnection;

    async fn join(
        &mut self,
        room_id: &str,
        participant_id: ParticipantId,
    ) -> Result<(SignalingConnection, mpsc::UnboundedReceiver<ChannelEvent>), CallError> {
        let mut conn = self.connect(room_id, participant_id).await?;
        let events = conn
            .take_events()
            .ok_or(CallError::SignalingDisconnected)?;
        Ok((conn, events))
    }
}

/// Snapshot of an endpoint for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub joined: bool,
    /// The relay acknowledged the join
    pub acknowledged: bool,
    pub local_stream: Option<String>,
    pub remote_stream: Option<String>,
    pub initiator: Option<TransportState>,
    pub responder: Option<TransportState>,
    pub muted: bool,
    pub can_start_call: bool,
    pub can_end_call: bool,
}

enum Command {
    StartLocal(oneshot::Sender<Result<String, CallError>>),
    StartCall(NegotiationRole, oneshot::Sender<Result<(), CallError>>),
    EndCall(oneshot::Sender<bool>),
    ToggleMute(oneshot::Sender<Option<bool>>),
    SwitchCamera(oneshot::Sender<Option<Facing>>),
    Status(oneshot::Sender<EndpointStatus>),
    Shutdown,
}

enum EndpointEvent {
    Command(Command),
    Channel(ChannelEvent),
    Session(SessionEvent),
}

/// The single owner of one participant's call state
pub struct Endpoint<C: SignalingConnector> {
    participant_id: ParticipantId,
    connector: C,
    calls: CallManager,
    negotiator: Option<Negotiator<C::Relay>>,
    acknowledged: bool,
    commands: mpsc::Receiver<Command>,
    channel_events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    events: broadcast::Sender<CallEvent>,
}

impl<C: SignalingConnector> Endpoint<C> {
    /// Start the endpoint task and return a handle to drive it
    pub fn spawn(
        config: CallConfig,
        participant_id: ParticipantId,
        connector: C,
        media: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
    ) -> EndpointHandle {
        let room_id = config.room_id.clone();
        let (session_tx, session_events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let endpoint = Self {
            participant_id,
            connector,
            calls: CallManager::new(config, media, transports, session_tx),
            negotiator: None,
            acknowledged: false,
            commands,
            channel_events: None,
            session_events,
            events: events.clone(),
        };

        info!("Endpoint {} starting for room {}", participant_id, room_id);
        let task = tokio::spawn(endpoint.run());

        EndpointHandle {
            participant_id,
            room_id,
            commands: commands_tx,
            events,
            task: Some(task),
        }
    }

    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => EndpointEvent::Command(cmd),
                    None => break,
                },
                Some(event) = self.session_events.recv() => EndpointEvent::Session(event),
                event = next_channel_event(&mut self.channel_events) => EndpointEvent::Channel(event),
            };

            if !self.handle(event).await {
                break;
            }
        }

        if self.calls.end_call().await {
            self.publish(CallEvent::StreamsClosed);
        }
        debug!("Endpoint {} stopped", self.participant_id);
    }

    async fn handle(&mut self, event: EndpointEvent) -> bool {
        match event {
            EndpointEvent::Command(Command::Shutdown) => return false,
            EndpointEvent::Command(cmd) => self.handle_command(cmd).await,
            EndpointEvent::Channel(event) => self.handle_channel_event(event).await,
            EndpointEvent::Session(event) => self.handle_session_event(event).await,
        }
        true
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartLocal(reply) => {
                let result = self.start_local().await;
                let _ = reply.send(result);
            }
            Command::StartCall(role, reply) => {
                let result = self.start_call(role).await;
                if matches!(result, Err(CallError::SignalingDisconnected)) {
                    self.drop_signaling();
                    self.fail_call("signaling disconnected").await;
                }
                let _ = reply.send(result);
            }
            Command::EndCall(reply) => {
                let ended = self.calls.end_call().await;
                if ended {
                    self.publish(CallEvent::StreamsClosed);
                }
                let _ = reply.send(ended);
            }
            Command::ToggleMute(reply) => {
                let muted = self.calls.toggle_mute();
                if let Some(muted) = muted {
                    self.publish(CallEvent::MuteChanged { muted });
                }
                let _ = reply.send(muted);
            }
            Command::SwitchCamera(reply) => {
                let facing = self.calls.switch_camera();
                if let Some(facing) = facing {
                    self.publish(CallEvent::CameraSwitched { facing });
                }
                let _ = reply.send(facing);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown => {}
        }
    }

    async fn start_local(&mut self) -> Result<String, CallError> {
        let stream = self.calls.start_local().await?;

        if self.negotiator.is_none() {
            let room_id = self.calls.config().room_id.clone();
            let (relay, channel_events) = self.connector.join(&room_id, self.participant_id).await?;
            self.negotiator = Some(Negotiator::new(self.participant_id, &room_id, relay));
            self.channel_events = Some(channel_events);
        }

        let url = stream.to_url();
        self.publish(CallEvent::LocalStreamReady { url: url.clone() });
        Ok(url)
    }

    async fn start_call(&mut self, role: NegotiationRole) -> Result<(), CallError> {
        let Some(negotiator) = self.negotiator.as_mut() else {
            return Err(if self.calls.local_stream().is_none() {
                CallError::NoLocalStream
            } else {
                CallError::SignalingDisconnected
            });
        };
        negotiator.start_call(&mut self.calls, role).await
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Joined(join) => {
                self.acknowledged = true;
                info!(
                    room = %join.room_id,
                    participant = %join.participant_id,
                    "Joined room"
                );
            }
            ChannelEvent::Error(message) => {
                warn!("Relay error: {}", message);
            }
            ChannelEvent::Message(msg) => {
                let Some(negotiator) = self.negotiator.as_mut() else {
                    return;
                };
                match negotiator.handle_message(&mut self.calls, msg).await {
                    Ok(disposition) => debug!("Handled relayed message: {:?}", disposition),
                    Err(e) => self.handle_error(e).await,
                }
            }
            ChannelEvent::Disconnected => {
                warn!("Signaling channel lost");
                self.drop_signaling();
                self.fail_call("signaling disconnected").await;
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        let Some(negotiator) = self.negotiator.as_mut() else {
            debug!("Dropping {} session event without signaling", event.role);
            return;
        };
        match negotiator.handle_session_event(&mut self.calls, event).await {
            Ok(Some(event)) => self.publish(event),
            Ok(None) => {}
            Err(e) => self.handle_error(e).await,
        }
    }

    async fn handle_error(&mut self, e: CallError) {
        match e {
            e if e.is_recoverable() => warn!("Discarding: {}", e),
            CallError::NoLocalStream => {
                warn!("Ignoring negotiation before local media is ready");
            }
            CallError::SignalingDisconnected => {
                self.drop_signaling();
                self.fail_call("signaling disconnected").await;
            }
            e => {
                error!("Call failed: {}", e);
                self.fail_call(&e.to_string()).await;
            }
        }
    }

    fn drop_signaling(&mut self) {
        self.negotiator = None;
        self.channel_events = None;
        self.acknowledged = false;
    }

    async fn fail_call(&mut self, reason: &str) {
        if self.calls.call().is_none() {
            return;
        }
        self.publish(CallEvent::CallFailed {
            reason: reason.to_string(),
        });
        if self.calls.end_call().await {
            self.publish(CallEvent::StreamsClosed);
        }
    }

    fn status(&self) -> EndpointStatus {
        EndpointStatus {
            participant_id: self.participant_id,
            room_id: self.calls.config().room_id.clone(),
            joined: self.negotiator.is_some(),
            acknowledged: self.acknowledged,
            local_stream: self.calls.local_stream().map(|s| s.to_url()),
            remote_stream: self.calls.remote_stream().map(|s| s.to_url()),
            initiator: self.calls.state(NegotiationRole::Initiator),
            responder: self.calls.state(NegotiationRole::Responder),
            muted: self.calls.is_muted(),
            can_start_call: self.calls.can_start_call(),
            can_end_call: self.calls.can_end_call(),
        }
    }

    fn publish(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

async fn next_channel_event(rx: &mut Option<mpsc::UnboundedReceiver<ChannelEvent>>) -> ChannelEvent {
    match rx {
        Some(rx) => rx.recv().await.unwrap_or(ChannelEvent::Disconnected),
        None => std::future::pending().await,
    }
}

/// Handle to a running [`Endpoint`]
pub struct EndpointHandle {
    participant_id: ParticipantId,
    room_id: RoomId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
    task: Option<JoinHandle<()>>,
}

impl EndpointHandle {
    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Subscribe to call notifications
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CallError::EndpointStopped)?;
        rx.await.map_err(|_| CallError::EndpointStopped)
    }

    /// Acquire local media and join the room; returns the local stream URL
    pub async fn start_local(&self) -> Result<String, CallError> {
        self.request(Command::StartLocal).await?
    }

    pub async fn start_call(&self, role: NegotiationRole) -> Result<(), CallError> {
        self.request(|tx| Command::StartCall(role, tx)).await?
    }

    /// End the call and release media; returns whether anything was released
    pub async fn end_call(&self) -> Result<bool, CallError> {
        self.request(Command::EndCall).await
    }

    pub async fn toggle_mute(&self) -> Result<Option<bool>, CallError> {
        self.request(Command::ToggleMute).await
    }

    pub async fn switch_camera(&self) -> Result<Option<Facing>, CallError> {
        self.request(Command::SwitchCamera).await
    }

    pub async fn status(&self) -> Result<EndpointStatus, CallError> {
        self.request(Command::Status).await
    }

    /// Stop the endpoint, ending any call in progress
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Endpoint task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
