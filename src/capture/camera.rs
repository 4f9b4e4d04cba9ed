//! Camera abstraction for frame capture.
//!
//! This module provides a trait-based abstraction over camera hardware,
//! allowing for both real camera input and mock implementations for testing.
//! Capture is asynchronous: a device read is a suspension point of the
//! capture cycle.

use super::{frame::BYTES_PER_PIXEL, CaptureConfig, Frame};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Errors that can occur during camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to open camera: {0}")]
    OpenFailed(String),
    #[error("failed to configure camera: {0}")]
    ConfigFailed(String),
    #[error("failed to capture frame: {0}")]
    CaptureFailed(String),
    #[error("camera not initialized")]
    NotInitialized,
}

/// Trait for camera implementations.
///
/// The device handle is shared process-wide; sessions borrow it through
/// [`SharedCamera`] and never open or close it themselves.
pub trait Camera: Send + 'static {
    /// Opens and initializes the camera with the given configuration.
    fn open(&mut self, config: &CaptureConfig) -> Result<(), CameraError>;

    /// Captures a single still.
    fn capture(&mut self) -> impl Future<Output = Result<Frame, CameraError>> + Send;

    /// Checks if the camera is currently open.
    fn is_open(&self) -> bool;

    /// Closes the camera and releases resources.
    fn close(&mut self);
}

/// Process-wide camera handle shared between sessions.
pub type SharedCamera<C> = Arc<tokio::sync::Mutex<C>>;

/// Wraps a camera into a [`SharedCamera`].
pub fn shared<C: Camera>(camera: C) -> SharedCamera<C> {
    Arc::new(tokio::sync::Mutex::new(camera))
}

/// Mock camera that generates synthetic frames.
///
/// Latency, failures and a capture gate can be injected to exercise the
/// capture loop under slow or flaky devices.
#[derive(Debug, Default)]
pub struct MockCamera {
    config: Option<CaptureConfig>,
    sequence: u64,
    latency: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    pending_failures: u32,
    attempts: Arc<AtomicU64>,
}

impl MockCamera {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every capture by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes every capture wait for (and consume) one permit of `gate`.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Fails the next `count` captures.
    pub fn fail_next(&mut self, count: u32) {
        self.pending_failures = count;
    }

    /// Counter of capture attempts, readable after the camera is shared.
    pub fn attempts(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.attempts)
    }

    fn synthesize(&mut self, width: u32, height: u32) -> Result<Frame, CameraError> {
        let seq = self.sequence;
        let mut pixels = Vec::with_capacity(width as usize * height as usize * BYTES_PER_PIXEL);
        for y in 0..height {
            for x in 0..width {
                // Moving gradient so consecutive frames differ
                pixels.push(((x as u64 + seq) % 256) as u8);
                pixels.push(((y as u64 + seq) % 256) as u8);
                pixels.push(((x + y) % 256) as u8);
            }
        }
        self.sequence += 1;
        Frame::from_rgb(pixels, width, height, self.sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }
}

impl Camera for MockCamera {
    fn open(&mut self, config: &CaptureConfig) -> Result<(), CameraError> {
        config
            .validate()
            .map_err(|e| CameraError::ConfigFailed(e.to_string()))?;
        self.config = Some(config.clone());
        self.sequence = 0;
        tracing::info!("MockCamera opened with config: {:?}", config);
        Ok(())
    }

    fn capture(&mut self) -> impl Future<Output = Result<Frame, CameraError>> + Send {
        async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                gate.acquire()
                    .await
                    .map_err(|_| CameraError::CaptureFailed("capture gate closed".into()))?
                    .forget();
            }
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }

            let (width, height) = match &self.config {
                Some(config) => (config.width, config.height),
                None => return Err(CameraError::NotInitialized),
            };

            if self.pending_failures > 0 {
                self.pending_failures -= 1;
                return Err(CameraError::CaptureFailed("injected failure".into()));
            }

            self.synthesize(width, height)
        }
    }

    fn is_open(&self) -> bool {
        self.config.is_some()
    }

    fn close(&mut self) {
        self.config = None;
        tracing::info!("MockCamera closed");
    }
}
