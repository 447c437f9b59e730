//! WebSocket client side of the signaling channel
//!
//! A connection joins exactly one room at connect time. Inbound frames are
//! delivered in arrival order as [`ChannelEvent`]s; self-echo is not filtered
//! here. A lost connection is reported once as
//! [`ChannelEvent::Disconnected`] and is never retried.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::relay::Relay;
use crate::error::CallError;
use crate::protocol::{JoinMessage, ParticipantId, RelayFrame, RoomId, SignalingMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound events from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The relay acknowledged the join
    Joined(JoinMessage),
    /// A message relayed within the room (possibly our own echo)
    Message(SignalingMessage),
    /// The relay rejected a request
    Error(String),
    /// The connection was lost
    Disconnected,
}

/// Signaling client for connecting to a relay server
pub struct SignalingClient {
    server_url: String,
}

impl SignalingClient {
    /// Create a new signaling client
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
        }
    }

    /// Connect to the relay and join `room_id` as `participant_id`
    pub async fn connect(
        &self,
        room_id: &str,
        participant_id: ParticipantId,
    ) -> Result<SignalingConnection, CallError> {
        let (ws_stream, _) = connect_async(&self.server_url)
            .await
            .map_err(|e| CallError::Signaling(format!("Connect failed: {}", e)))?;

        debug!("Connected to relay server: {}", self.server_url);

        let (write, read) = ws_stream.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let read_handle = tokio::spawn(read_loop(read, events_tx));

        let mut conn = SignalingConnection {
            write,
            room_id: room_id.to_string(),
            participant_id,
            events: Some(events_rx),
            read_handle: Some(read_handle),
        };

        conn.send_frame(&RelayFrame::Join(JoinMessage {
            room_id: room_id.to_string(),
            participant_id,
        }))
        .await?;
        info!("Joining room {} as participant {}", room_id, participant_id);

        Ok(conn)
    }
}

async fn read_loop(mut read: SplitStream<WsStream>, events: mpsc::UnboundedSender<ChannelEvent>) {
    loop {
        let event = match read.next().await {
            Some(Ok(Message::Text(text))) => match RelayFrame::from_json(&text) {
                Ok(RelayFrame::Message(msg)) => ChannelEvent::Message(msg),
                Ok(RelayFrame::Joined(join)) => ChannelEvent::Joined(join),
                Ok(RelayFrame::Error { message }) => ChannelEvent::Error(message),
                Ok(RelayFrame::Join(_)) => continue,
                Err(e) => {
                    warn!("Unknown message: {} ({})", text, e);
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!("Relay receive failed: {}", e);
                break;
            }
            _ => continue,
        };

        if events.send(event).is_err() {
            return;
        }
    }

    let _ = events.send(ChannelEvent::Disconnected);
}

/// An active, joined connection to the relay server
pub struct SignalingConnection {
    write: SplitSink<WsStream, Message>,
    room_id: RoomId,
    participant_id: ParticipantId,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    read_handle: Option<JoinHandle<()>>,
}

impl SignalingConnection {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    /// Take the inbound event stream; only the first call returns `Some`
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.take()
    }

    async fn send_frame(&mut self, frame: &RelayFrame) -> Result<(), CallError> {
        let json = frame.to_json()?;
        self.write.send(Message::Text(json)).await.map_err(|e| match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                CallError::SignalingDisconnected
            }
            other => CallError::Signaling(format!("Send failed: {}", other)),
        })
    }

    /// Relay a message to the room
    pub async fn send(&mut self, msg: SignalingMessage) -> Result<(), CallError> {
        self.send_frame(&RelayFrame::Message(msg)).await
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<(), CallError> {
        let result = self
            .write
            .close()
            .await
            .map_err(|e| CallError::Signaling(format!("Close failed: {}", e)));
        if let Some(handle) = self.read_handle.take() {
            handle.abort();
        }
        result
    }
}

impl Drop for SignalingConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.read_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Relay for SignalingConnection {
    async fn relay(&mut self, message: SignalingMessage) -> Result<(), CallError> {
        self.send(message).await
    }
}
