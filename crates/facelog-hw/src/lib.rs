//! facelog-hw: frame acquisition.
//!
//! V4L2 camera capture, directory replay for camera-less runs, and the
//! grayscale pixel helpers both share.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{ReplaySource, VideoSource};
