//! Camera capture configuration.
//!
//! Frames are captured well below native resolution and compressed
//! lossily. The backend runs its own detection, so the goal is bounded
//! payload size and latency rather than image fidelity.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for camera capture and outbound frame encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Camera device index.
    pub device_id: u32,
    /// Requested frame width in pixels.
    pub width: u32,
    /// Requested frame height in pixels.
    pub height: u32,
    /// Requested device frame rate.
    pub fps: u32,
    /// Downscale factor applied before encoding (0.0 exclusive to 1.0 inclusive).
    pub scale: f32,
    /// JPEG quality for outbound frames (1-100).
    pub jpeg_quality: u8,
    /// Milliseconds between capture ticks.
    pub interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            width: 640,
            height: 480,
            fps: 30,
            scale: 0.5,
            jpeg_quality: 60,
            interval_ms: 1000, // one frame per second
        }
    }
}

impl CaptureConfig {
    /// Creates a new configuration with the specified dimensions.
    pub fn with_dimensions(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    /// Returns the capture tick interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Validates the configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions);
        }
        if self.fps == 0 || self.fps > 120 {
            return Err(ConfigError::InvalidFrameRate);
        }
        if !(self.scale > 0.0 && self.scale <= 1.0) {
            return Err(ConfigError::InvalidScale(self.scale));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ConfigError::InvalidQuality(self.jpeg_quality));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid frame dimensions")]
    InvalidDimensions,
    #[error("invalid frame rate (must be 1-120 fps)")]
    InvalidFrameRate,
    #[error("invalid downscale factor {0} (must be in (0, 1])")]
    InvalidScale(f32),
    #[error("invalid jpeg quality {0} (must be 1-100)")]
    InvalidQuality(u8),
    #[error("capture interval must be non-zero")]
    InvalidInterval,
    #[error("invalid backend address: {0}")]
    InvalidBackendAddress(String),
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    #[error("failed to parse config file: {0}")]
    ParseError(String),
}
