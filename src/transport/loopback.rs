//! In-process media transport
//!
//! Simulates a platform peer connection: generates minimal SDP announcing the
//! attached stream, gathers synthetic host/srflx candidates once both
//! descriptions are set, and reports the peer's stream after the first remote
//! candidate is applied. No media flows.

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{ConnectionState, MediaTransport, TransportEvent, TransportFactory};
use crate::error::CallError;
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

/// Attribute carrying the announced stream id
const MSID_PREFIX: &str = "a=msid-semantic: WMS ";

/// Simulated peer connection
pub struct LoopbackTransport {
    session_id: u64,
    ice_servers: Vec<String>,
    stream: Option<MediaStream>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    gathered: bool,
    connected: bool,
    closed: bool,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl LoopbackTransport {
    pub fn new(ice_servers: &[String]) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session_id: rand::thread_rng().gen(),
            ice_servers: ice_servers.to_vec(),
            stream: None,
            local: None,
            remote: None,
            remote_candidates: 0,
            gathered: false,
            connected: false,
            closed: false,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        if self.closed {
            return Err(CallError::Transport("transport closed".to_string()));
        }
        Ok(())
    }

    fn emit(&self, event: TransportEvent) {
        // Receiver gone means nobody is subscribed any more
        let _ = self.events_tx.send(event);
    }

    fn build_sdp(&self, setup: &str) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.session_id
        );

        if let Some(stream) = &self.stream {
            sdp.push_str(&format!("{}{}\r\n", MSID_PREFIX, stream.id()));
            for track in stream.tracks() {
                let line = match track.kind {
                    TrackKind::Audio => "m=audio 9 UDP/TLS/RTP/SAVPF 111",
                    TrackKind::Video => "m=video 9 UDP/TLS/RTP/SAVPF 96",
                };
                sdp.push_str(line);
                sdp.push_str("\r\n");
                sdp.push_str(&format!("a=setup:{}\r\n", setup));
            }
        }

        sdp
    }

    /// Start emitting local candidates once both descriptions are known
    fn maybe_gather(&mut self) {
        if self.gathered || self.local.is_none() || self.remote.is_none() {
            return;
        }
        self.gathered = true;
        self.emit(TransportEvent::ConnectionState(ConnectionState::Connecting));

        let mut rng = rand::thread_rng();
        let port: u16 = rng.gen_range(49152..65535);
        self.emit(TransportEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:1 1 UDP 2122252543 127.0.0.1 {} typ host",
            port
        ))));

        for (i, server) in self.ice_servers.iter().enumerate() {
            if !server.starts_with("stun:") {
                continue;
            }
            let mapped_port: u16 = rng.gen_range(1024..65535);
            self.emit(TransportEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{} 1 UDP 1686052607 203.0.113.{} {} typ srflx raddr 127.0.0.1 rport {}",
                i + 2,
                rng.gen_range(1..255u8),
                mapped_port,
                port
            ))));
        }
        debug!("Loopback transport {} gathered candidates", self.session_id);
    }

    /// Report the peer's stream once connectivity is plausible
    fn maybe_connect(&mut self) {
        if self.connected || !self.gathered || self.remote_candidates == 0 {
            return;
        }
        self.connected = true;
        self.emit(TransportEvent::ConnectionState(ConnectionState::Connected));

        if let Some(stream) = self.remote.as_ref().and_then(|d| remote_stream_of(&d.payload)) {
            self.emit(TransportEvent::RemoteStream(stream));
        }
    }
}

/// Reconstruct the stream a description announces
fn remote_stream_of(sdp: &str) -> Option<MediaStream> {
    let id = sdp
        .lines()
        .find_map(|line| line.strip_prefix(MSID_PREFIX))?
        .trim();

    let tracks = sdp
        .lines()
        .filter_map(|line| {
            let kind = if line.starts_with("m=audio") {
                TrackKind::Audio
            } else if line.starts_with("m=video") {
                TrackKind::Video
            } else {
                return None;
            };
            Some(MediaTrack {
                id: Uuid::new_v4().to_string(),
                kind,
                enabled: true,
                facing: None,
                source_id: None,
            })
        })
        .collect();

    Some(MediaStream::with_id(id, tracks))
}

fn is_candidate(payload: &str) -> bool {
    payload.starts_with("candidate:") && payload.contains(" typ ")
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn add_stream(&mut self, stream: &MediaStream) {
        self.stream = Some(stream.clone());
    }

    fn remove_stream(&mut self) {
        self.stream = None;
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, CallError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.build_sdp("actpass")))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, CallError> {
        self.ensure_open()?;
        match &self.remote {
            Some(desc) if desc.sdp_type == SdpType::Offer => {
                Ok(SessionDescription::answer(self.build_sdp("active")))
            }
            _ => Err(CallError::Transport(
                "cannot answer without a remote offer".to_string(),
            )),
        }
    }

    async fn set_local_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<(), CallError> {
        self.ensure_open()?;
        self.local = Some(desc.clone());
        self.maybe_gather();
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<(), CallError> {
        self.ensure_open()?;
        if !desc.payload.starts_with("v=0") {
            return Err(CallError::Transport("malformed session description".to_string()));
        }
        self.remote = Some(desc.clone());
        self.maybe_gather();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), CallError> {
        self.ensure_open()?;
        if self.remote.is_none() {
            return Err(CallError::Transport("remote description not set".to_string()));
        }
        if !is_candidate(&candidate.payload) {
            return Err(CallError::CandidateApplyFailed(format!(
                "malformed candidate: {}",
                candidate.payload
            )));
        }

        trace!("Loopback transport {} applied {}", self.session_id, candidate.payload);
        self.remote_candidates += 1;
        self.maybe_connect();
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.take()
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stream = None;
            self.emit(TransportEvent::ConnectionState(ConnectionState::Closed));
        }
    }
}

/// Builds [`LoopbackTransport`]s
#[derive(Debug, Clone, Default)]
pub struct LoopbackFactory;

impl TransportFactory for LoopbackFactory {
    fn create(&self, ice_servers: &[String]) -> Result<Box<dyn MediaTransport>, CallError> {
        Ok(Box::new(LoopbackTransport::new(ice_servers)))
    }
}
