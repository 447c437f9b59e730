//! Buffer for candidates that arrive before the remote description
//!
//! Candidate discovery races ahead of the offer/answer round-trip. A
//! candidate applied before the remote description exists is rejected by the
//! transport, and a lost candidate makes connectivity fail silently, so early
//! arrivals wait here and are applied in arrival order once the description
//! is known.

use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::MediaTransport;
use crate::error::CallError;
use crate::protocol::IceCandidate;

/// Anything candidates can be applied to
#[async_trait]
pub trait CandidateSink: Send {
    async fn apply_candidate(&mut self, candidate: &IceCandidate) -> Result<(), CallError>;
}

#[async_trait]
impl CandidateSink for dyn MediaTransport {
    async fn apply_candidate(&mut self, candidate: &IceCandidate) -> Result<(), CallError> {
        self.add_ice_candidate(candidate).await
    }
}

/// Outcome of [`CandidateQueue::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// Held until the queue is drained
    Buffered,
    /// The queue was already drained; apply the candidate directly
    Forward(IceCandidate),
}

/// FIFO of candidates awaiting a remote description
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    drained: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate, or hand it back for direct application once drained
    pub fn enqueue(&mut self, candidate: IceCandidate) -> Enqueued {
        if self.drained {
            return Enqueued::Forward(candidate);
        }
        self.pending.push_back(candidate);
        debug!("Queued ICE candidate ({} pending)", self.pending.len());
        Enqueued::Buffered
    }

    /// Apply and remove every queued candidate in arrival order
    ///
    /// A candidate the sink rejects is logged and dropped; the remaining
    /// candidates are still applied. Returns the number applied successfully.
    pub async fn drain<S>(&mut self, sink: &mut S) -> usize
    where
        S: CandidateSink + ?Sized,
    {
        self.drained = true;

        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            match sink.apply_candidate(&candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!("Dropping queued candidate {}: {}", candidate.payload, e),
            }
        }

        if applied > 0 {
            debug!("Drained {} queued ICE candidates", applied);
        }
        applied
    }

    /// Discard everything without applying it
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }
}
