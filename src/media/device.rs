//! Capture device enumeration and selection

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::stream::{Facing, MediaStream};
use crate::config::CaptureConfig;
use crate::error::CallError;

/// Unique identifier for a capture device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

/// Kind of media device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
    VideoInput,
}

/// Information about a media device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDevice {
    /// Device identifier
    pub id: DeviceId,
    /// Device kind
    pub kind: DeviceKind,
    /// Display name
    pub label: String,
    /// Camera facing, when the platform reports it
    pub facing: Option<Facing>,
}

/// Video capture constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    pub min_width: u32,
    pub min_height: u32,
    pub min_frame_rate: u32,
    pub facing_mode: Facing,
    /// Preferred capture device, if one matches the facing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<DeviceId>,
}

/// Constraints passed to [`MediaDevices::get_user_media`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaConstraints {
    pub audio: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Build constraints from capture preferences and the enumerated devices
    pub fn for_capture(config: &CaptureConfig, devices: &[MediaDevice]) -> Self {
        let facing = if config.front_camera {
            Facing::User
        } else {
            Facing::Environment
        };

        Self {
            audio: config.audio,
            video: Some(VideoConstraints {
                min_width: config.min_width,
                min_height: config.min_height,
                min_frame_rate: config.min_frame_rate,
                facing_mode: facing,
                source_id: select_video_source(devices, facing).map(|d| d.id.clone()),
            }),
        }
    }
}

/// Find the video input facing the requested direction
pub fn select_video_source(devices: &[MediaDevice], facing: Facing) -> Option<&MediaDevice> {
    devices
        .iter()
        .find(|d| d.kind == DeviceKind::VideoInput && d.facing == Some(facing))
}

/// Platform media capability: device listing and capture
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// List available media devices
    async fn enumerate_devices(&self) -> Result<Vec<MediaDevice>, CallError>;

    /// Open a capture stream satisfying the constraints
    async fn get_user_media(&self, constraints: &MediaConstraints)
        -> Result<MediaStream, CallError>;
}
