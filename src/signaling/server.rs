//! Room-scoped relay server
//!
//! Every `message` frame from a joined participant is broadcast to all
//! members of its room, the sender included; consumers filter their own
//! echoes. Rooms are created on first join and removed when the last member
//! leaves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::CallError;
use crate::protocol::{JoinMessage, ParticipantId, RelayFrame, RoomId, SignalingMessage};

/// Maximum participants per room
pub const MAX_PARTICIPANTS_PER_ROOM: usize = 2;

/// Room information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: RoomId,
    pub participant_count: usize,
}

/// Room state on the server
struct Room {
    members: HashSet<ParticipantId>,
    broadcast_tx: broadcast::Sender<SignalingMessage>,
}

type Rooms = Arc<RwLock<HashMap<RoomId, Room>>>;

/// Relay server state
#[derive(Clone)]
pub struct RelayServer {
    rooms: Rooms,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bind to `addr` and serve until the task is cancelled
    pub async fn run(&self, addr: &str) -> Result<(), CallError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CallError::Signaling(format!("Bind failed: {}", e)))?;

        info!("Relay server listening on {}", addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CallError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("New relay connection from {}", peer_addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.accept_plain(stream).await {
                            warn!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Serve wss:// connections, completing the TLS handshake per connection
    pub async fn serve_tls(
        &self,
        listener: TcpListener,
        acceptor: TlsAcceptor,
    ) -> Result<(), CallError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("New TLS connection from {}", peer_addr);
                    let server = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.accept_tls(stream, acceptor).await {
                            warn!("Connection error for {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    async fn accept_tls(&self, stream: TcpStream, acceptor: TlsAcceptor) -> Result<(), CallError> {
        let tls_stream = acceptor
            .accept(stream)
            .await
            .map_err(|e| CallError::Signaling(format!("TLS handshake failed: {}", e)))?;
        let ws_stream = accept_async(tls_stream)
            .await
            .map_err(|e| CallError::Signaling(format!("WebSocket accept failed: {}", e)))?;
        self.handle_connection(ws_stream).await
    }

    async fn accept_plain(&self, stream: TcpStream) -> Result<(), CallError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| CallError::Signaling(format!("WebSocket accept failed: {}", e)))?;
        self.handle_connection(ws_stream).await
    }

    /// List rooms with at least one member
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let rooms = self.rooms.read().await;
        rooms
            .iter()
            .map(|(id, room)| RoomInfo {
                id: id.clone(),
                participant_count: room.members.len(),
            })
            .collect()
    }

    /// Relay frames for one upgraded WebSocket until it closes
    pub async fn handle_connection<S>(&self, ws_stream: WebSocketStream<S>) -> Result<(), CallError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws_stream.split();
        let mut membership: Option<JoinMessage> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<SignalingMessage>> = None;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match RelayFrame::from_json(&text) {
                                Ok(frame) => {
                                    let response = self
                                        .process_frame(frame, &mut membership, &mut broadcast_rx)
                                        .await;

                                    if let Some(resp) = response {
                                        if !send_frame(&mut write, resp).await {
                                            break;
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!("Invalid frame: {}", e);
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break;
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }

                broadcast = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        std::future::pending().await
                    }
                } => {
                    match broadcast {
                        Ok(msg) => {
                            if !send_frame(&mut write, RelayFrame::Message(msg)).await {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Connection lagged, {} relayed messages dropped", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            broadcast_rx = None;
                        }
                    }
                }
            }
        }

        if let Some(join) = membership {
            self.leave(&join).await;
        }

        Ok(())
    }

    async fn process_frame(
        &self,
        frame: RelayFrame,
        membership: &mut Option<JoinMessage>,
        broadcast_rx: &mut Option<broadcast::Receiver<SignalingMessage>>,
    ) -> Option<RelayFrame> {
        match frame {
            RelayFrame::Join(join) => {
                if let Some(previous) = membership.take() {
                    self.leave(&previous).await;
                    *broadcast_rx = None;
                }

                let mut rooms = self.rooms.write().await;
                let room = rooms.entry(join.room_id.clone()).or_insert_with(|| {
                    let (tx, _) = broadcast::channel(100);
                    Room {
                        members: HashSet::new(),
                        broadcast_tx: tx,
                    }
                });

                if room.members.len() >= MAX_PARTICIPANTS_PER_ROOM
                    && !room.members.contains(&join.participant_id)
                {
                    return Some(RelayFrame::Error {
                        message: "Room is full".to_string(),
                    });
                }

                room.members.insert(join.participant_id);
                *broadcast_rx = Some(room.broadcast_tx.subscribe());
                *membership = Some(join.clone());

                info!(
                    "Participant {} joined room {} ({} members)",
                    join.participant_id,
                    join.room_id,
                    room.members.len()
                );

                Some(RelayFrame::Joined(join))
            }

            RelayFrame::Message(msg) => {
                let joined = membership
                    .as_ref()
                    .is_some_and(|m| m.room_id == msg.room_id);
                if !joined {
                    return Some(RelayFrame::Error {
                        message: "Not joined to room".to_string(),
                    });
                }

                let rooms = self.rooms.read().await;
                if let Some(room) = rooms.get(&msg.room_id) {
                    debug!(
                        "Relaying message from {} in room {}",
                        msg.participant_id, msg.room_id
                    );
                    let _ = room.broadcast_tx.send(msg);
                }
                None
            }

            // Server->Client frames are ignored if received
            RelayFrame::Joined(_) | RelayFrame::Error { .. } => None,
        }
    }

    async fn leave(&self, join: &JoinMessage) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(&join.room_id) {
            room.members.remove(&join.participant_id);
            info!("Participant {} left room {}", join.participant_id, join.room_id);

            if room.members.is_empty() {
                rooms.remove(&join.room_id);
                info!("Room {} removed (empty)", join.room_id);
            }
        }
    }
}

/// Encode and write one frame; false once the connection is unusable
async fn send_frame<W>(write: &mut W, frame: RelayFrame) -> bool
where
    W: Sink<Message> + Unpin,
{
    let json = match frame.to_json() {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode relay frame: {}", e);
            return false;
        }
    };
    write.send(Message::Text(json)).await.is_ok()
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionDescription;

    fn join(room: &str, id: u64) -> JoinMessage {
        JoinMessage {
            room_id: room.to_string(),
            participant_id: ParticipantId(id),
        }
    }

    #[tokio::test]
    async fn test_join_acknowledged() {
        let server = RelayServer::new();
        let mut membership = None;
        let mut rx = None;

        let resp = server
            .process_frame(RelayFrame::Join(join("r", 1)), &mut membership, &mut rx)
            .await;

        assert_eq!(resp, Some(RelayFrame::Joined(join("r", 1))));
        assert!(rx.is_some());
        assert_eq!(
            server.list_rooms().await,
            vec![RoomInfo {
                id: "r".to_string(),
                participant_count: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_third_participant_rejected() {
        let server = RelayServer::new();
        for id in 1..=2 {
            let (mut m, mut rx) = (None, None);
            server
                .process_frame(RelayFrame::Join(join("r", id)), &mut m, &mut rx)
                .await;
        }

        let (mut m, mut rx) = (None, None);
        let resp = server
            .process_frame(RelayFrame::Join(join("r", 3)), &mut m, &mut rx)
            .await;
        assert!(matches!(resp, Some(RelayFrame::Error { .. })));
        assert!(m.is_none());
    }

    #[tokio::test]
    async fn test_message_echoes_to_sender() {
        let server = RelayServer::new();
        let mut membership = None;
        let mut rx = None;
        server
            .process_frame(RelayFrame::Join(join("r", 1)), &mut membership, &mut rx)
            .await;

        let msg = SignalingMessage::with_description(
            "r",
            ParticipantId(1),
            SessionDescription::offer("v=0"),
        );
        let resp = server
            .process_frame(RelayFrame::Message(msg.clone()), &mut membership, &mut rx)
            .await;

        assert!(resp.is_none());
        let echoed = rx.as_mut().unwrap().recv().await.unwrap();
        assert_eq!(echoed, msg);
    }

    #[tokio::test]
    async fn test_message_before_join_rejected() {
        let server = RelayServer::new();
        let msg = SignalingMessage::with_description(
            "r",
            ParticipantId(1),
            SessionDescription::offer("v=0"),
        );

        let (mut m, mut rx) = (None, None);
        let resp = server
            .process_frame(RelayFrame::Message(msg), &mut m, &mut rx)
            .await;
        assert!(matches!(resp, Some(RelayFrame::Error { .. })));
    }

    #[tokio::test]
    async fn test_empty_room_removed() {
        let server = RelayServer::new();
        let (mut m, mut rx) = (None, None);
        server
            .process_frame(RelayFrame::Join(join("r", 1)), &mut m, &mut rx)
            .await;

        server.leave(&join("r", 1)).await;
        assert!(server.list_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_leaves_room() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::new();
        let serving = server.clone();
        let task = tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        let frame = RelayFrame::Join(join("r", 1)).to_json().unwrap();
        ws.send(Message::Text(frame)).await.unwrap();
        let ack = ws.next().await.unwrap().unwrap();
        assert_eq!(
            RelayFrame::from_json(ack.to_text().unwrap()).unwrap(),
            RelayFrame::Joined(join("r", 1))
        );
        assert_eq!(server.list_rooms().await.len(), 1);

        ws.close(None).await.unwrap();
        let mut emptied = false;
        for _ in 0..50 {
            if server.list_rooms().await.is_empty() {
                emptied = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        task.abort();
        assert!(emptied);
    }

    #[tokio::test]
    async fn test_send_frame_reports_failed_write() {
        let mut open = futures_util::sink::drain::<Message>();
        assert!(send_frame(&mut open, RelayFrame::Joined(join("r", 1))).await);

        let mut closed = Box::pin(futures_util::sink::unfold((), |(), _: Message| async {
            Err::<(), _>("connection closed")
        }));
        assert!(!send_frame(&mut closed, RelayFrame::Joined(join("r", 1))).await);
    }
}
