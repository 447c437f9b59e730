//! Media capability module
//!
//! Stream handles, capture devices and the platform capture interface.

mod device;
mod fake;
mod stream;

pub use device::{
    select_video_source, DeviceId, DeviceKind, MediaConstraints, MediaDevice, MediaDevices,
    VideoConstraints,
};
pub use fake::FakeMediaDevices;
pub use stream::{Facing, MediaStream, MediaTrack, TrackKind};
