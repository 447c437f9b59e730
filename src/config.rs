//! Call configuration

/// Default relay server address
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3000";

/// Default room shared by both participants
pub const DEFAULT_ROOM_ID: &str = "only_me";

/// Default STUN servers handed to every transport
pub const DEFAULT_ICE_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

/// Camera and microphone capture preferences
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Capture the microphone
    pub audio: bool,
    /// Minimum video width in pixels
    pub min_width: u32,
    /// Minimum video height in pixels
    pub min_height: u32,
    /// Minimum video frame rate
    pub min_frame_rate: u32,
    /// Start on the user-facing camera instead of the environment camera
    pub front_camera: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            audio: true,
            min_width: 500,
            min_height: 300,
            min_frame_rate: 30,
            front_camera: false,
        }
    }
}

/// Call configuration
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Relay server WebSocket URL
    pub relay_url: String,
    /// Room both participants join
    pub room_id: String,
    /// ICE server URLs (stun:/turn:)
    pub ice_servers: Vec<String>,
    /// Local capture preferences
    pub capture: CaptureConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            room_id: DEFAULT_ROOM_ID.to_string(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            capture: CaptureConfig::default(),
        }
    }
}

impl CallConfig {
    /// Configuration for a given relay and room, other settings default
    pub fn new(relay_url: &str, room_id: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            room_id: room_id.to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CallConfig::default();
        assert_eq!(config.room_id, "only_me");
        assert_eq!(config.ice_servers, vec!["stun:stun.l.google.com:19302"]);
        assert!(config.capture.audio);
        assert_eq!(config.capture.min_width, 500);
        assert_eq!(config.capture.min_height, 300);
        assert_eq!(config.capture.min_frame_rate, 30);
        assert!(!config.capture.front_camera);
    }

    #[test]
    fn test_new_overrides_inputs_only() {
        let config = CallConfig::new("ws://relay:9000", "room-7");
        assert_eq!(config.relay_url, "ws://relay:9000");
        assert_eq!(config.room_id, "room-7");
        assert_eq!(config.capture, CaptureConfig::default());
    }
}
