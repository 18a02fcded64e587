//! rollcall-hw — Webcam capture for the attendance loop.
//!
//! Provides V4L2-based camera access producing RGB frames, plus the frame
//! helpers the controller needs (downsampling, dark-frame check).

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{downsample, Frame, DEFAULT_DOWNSAMPLE_FACTOR};
