//! Call error types

use thiserror::Error;

/// Errors that can occur while negotiating or running a call
#[derive(Error, Debug)]
pub enum CallError {
    /// A transition was attempted from a state that does not allow it.
    ///
    /// Duplicate or out-of-order relay delivery produces these routinely, so
    /// callers log and discard them.
    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Signaling channel disconnected")]
    SignalingDisconnected,

    /// The peer's offer or answer could not be applied
    #[error("Remote description rejected: {0}")]
    RemoteDescriptionRejected(String),

    #[error("Failed to apply ICE candidate: {0}")]
    CandidateApplyFailed(String),

    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("No local stream attached")]
    NoLocalStream,

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Endpoint stopped")]
    EndpointStopped,
}

impl CallError {
    /// Whether this error is a protocol-sequencing error that is recovered
    /// locally by discarding the offending input
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::RemoteDescriptionRejected(_)
                | Self::CandidateApplyFailed(_)
        )
    }
}
