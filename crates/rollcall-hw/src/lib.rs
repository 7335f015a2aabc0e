//! rollcall-hw: Camera input for the attendance pipeline.
//!
//! Provides V4L2-based capture converted to RGB frames, a replay source over
//! a folder of images, and the [`FrameSource`] trait the capture loop pulls from.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, PixelFormat, VideoStream};
pub use source::{CameraSource, FrameSource, ImageFolderSource, StreamingDevice};
