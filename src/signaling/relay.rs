//! Outbound side of the signaling channel

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CallError;
use crate::protocol::SignalingMessage;

/// Sends messages to the other participant of the room
#[async_trait]
pub trait Relay: Send {
    async fn relay(&mut self, message: SignalingMessage) -> Result<(), CallError>;
}

/// In-process relay, e.g. for wiring two endpoints together directly
#[async_trait]
impl Relay for mpsc::UnboundedSender<SignalingMessage> {
    async fn relay(&mut self, message: SignalingMessage) -> Result<(), CallError> {
        self.send(message)
            .map_err(|_| CallError::SignalingDisconnected)
    }
}
