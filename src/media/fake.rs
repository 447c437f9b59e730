//! In-process media capability
//!
//! Produces synthetic capture streams from a fixed device list. Used by the
//! CLI's simulated endpoints and by tests.

use async_trait::async_trait;
use tracing::debug;

use super::device::{DeviceId, DeviceKind, MediaConstraints, MediaDevice, MediaDevices};
use super::stream::{MediaStream, MediaTrack};
use crate::error::CallError;

/// Synthetic media devices
#[derive(Debug, Clone)]
pub struct FakeMediaDevices {
    devices: Vec<MediaDevice>,
}

impl FakeMediaDevices {
    /// A phone-like device set: microphone plus front and back cameras
    pub fn new() -> Self {
        Self::with_devices(vec![
            MediaDevice {
                id: DeviceId("fake-mic".into()),
                kind: DeviceKind::AudioInput,
                label: "Fake microphone".into(),
                facing: None,
            },
            MediaDevice {
                id: DeviceId("fake-front".into()),
                kind: DeviceKind::VideoInput,
                label: "Fake front camera".into(),
                facing: Some(super::Facing::User),
            },
            MediaDevice {
                id: DeviceId("fake-back".into()),
                kind: DeviceKind::VideoInput,
                label: "Fake back camera".into(),
                facing: Some(super::Facing::Environment),
            },
        ])
    }

    pub fn with_devices(devices: Vec<MediaDevice>) -> Self {
        Self { devices }
    }

    /// No capture hardware at all
    pub fn empty() -> Self {
        Self::with_devices(Vec::new())
    }

    fn first_of(&self, kind: DeviceKind) -> Option<&MediaDevice> {
        self.devices.iter().find(|d| d.kind == kind)
    }
}

impl Default for FakeMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn enumerate_devices(&self) -> Result<Vec<MediaDevice>, CallError> {
        Ok(self.devices.clone())
    }

    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, CallError> {
        let mut tracks = Vec::new();

        if constraints.audio {
            let mic = self
                .first_of(DeviceKind::AudioInput)
                .ok_or_else(|| CallError::MediaUnavailable("no microphone".to_string()))?;
            tracks.push(MediaTrack::audio(Some(mic.id.clone())));
        }

        if let Some(video) = &constraints.video {
            let camera = video
                .source_id
                .as_ref()
                .and_then(|id| self.devices.iter().find(|d| &d.id == id))
                .or_else(|| self.first_of(DeviceKind::VideoInput))
                .ok_or_else(|| CallError::MediaUnavailable("no camera".to_string()))?;
            tracks.push(MediaTrack::video(video.facing_mode, Some(camera.id.clone())));
        }

        let stream = MediaStream::new(tracks);
        debug!("Opened fake capture stream {}", stream.id());
        Ok(stream)
    }
}
