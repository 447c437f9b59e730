//! Shared media stream handles

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::device::DeviceId;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Direction a camera faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    /// Front camera, facing the user
    User,
    /// Back camera, facing away from the user
    Environment,
}

impl Facing {
    pub fn toggled(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

/// A single audio or video track of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
    /// Camera facing (video tracks only)
    pub facing: Option<Facing>,
    /// Capture device backing this track
    pub source_id: Option<DeviceId>,
}

impl MediaTrack {
    pub fn audio(source_id: Option<DeviceId>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TrackKind::Audio,
            enabled: true,
            facing: None,
            source_id,
        }
    }

    pub fn video(facing: Facing, source_id: Option<DeviceId>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TrackKind::Video,
            enabled: true,
            facing: Some(facing),
            source_id,
        }
    }
}

struct StreamInner {
    id: String,
    tracks: RwLock<Vec<MediaTrack>>,
    released: AtomicBool,
}

/// Handle to a captured or received media stream
///
/// Clones share the same underlying stream, so the rendering surface and a
/// transport session observe the same tracks.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    /// Create a stream with a fresh id
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(&Uuid::new_v4().to_string(), tracks)
    }

    /// Create a stream with a known id (e.g. announced by the far side)
    pub fn with_id(id: &str, tracks: Vec<MediaTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.to_string(),
                tracks: RwLock::new(tracks),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Displayable handle for the rendering surface
    pub fn to_url(&self) -> String {
        format!("stream://{}", self.inner.id)
    }

    /// Snapshot of the stream's tracks
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.inner.tracks.read().clone()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.inner.tracks.read().iter().any(|t| t.kind == kind)
    }

    /// Flip enablement of every audio track; returns true if now muted
    pub fn toggle_audio(&self) -> bool {
        let mut tracks = self.inner.tracks.write();
        let mut muted = false;
        for track in tracks.iter_mut().filter(|t| t.kind == TrackKind::Audio) {
            track.enabled = !track.enabled;
            muted = !track.enabled;
        }
        muted
    }

    /// True when the stream has audio and none of it is enabled
    pub fn is_muted(&self) -> bool {
        let tracks = self.inner.tracks.read();
        let mut audio = tracks.iter().filter(|t| t.kind == TrackKind::Audio).peekable();
        audio.peek().is_some() && audio.all(|t| !t.enabled)
    }

    /// Switch every video track to the opposite camera; returns the new facing
    pub fn switch_camera(&self) -> Option<Facing> {
        let mut tracks = self.inner.tracks.write();
        let mut facing = None;
        for track in tracks.iter_mut().filter(|t| t.kind == TrackKind::Video) {
            let next = track.facing.unwrap_or(Facing::Environment).toggled();
            track.facing = Some(next);
            // The previous device no longer backs the track
            track.source_id = None;
            facing = Some(next);
        }
        facing
    }

    /// Stop all tracks; the handle stays valid but carries no media
    pub fn release(&self) {
        if !self.inner.released.swap(true, Ordering::SeqCst) {
            for track in self.inner.tracks.write().iter_mut() {
                track.enabled = false;
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaStream {}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.read().len())
            .field("released", &self.is_released())
            .finish()
    }
}
