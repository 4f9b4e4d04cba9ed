//! Camera input and frame handling.
//!
//! This module provides abstractions for capturing stills from a camera
//! and managing camera configuration. The device handle is shared
//! process-wide; verification sessions only borrow it per capture.

mod camera;
mod config;
mod frame;
#[cfg(feature = "camera")]
mod webcam;

pub use camera::{shared, Camera, CameraError, MockCamera, SharedCamera};
pub use config::{CaptureConfig, ConfigError};
pub use frame::{Frame, FrameSizeError, BYTES_PER_PIXEL};
#[cfg(feature = "camera")]
pub use webcam::WebcamCamera;
