//! Webcam capture using nokhwa.
//!
//! The nokhwa device is not `Send` on every backend, so it lives on a
//! dedicated thread and stills are requested over a channel.

use super::{Camera, CameraError, CaptureConfig, Frame};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use std::future::Future;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type CaptureReply = oneshot::Sender<Result<Frame, CameraError>>;

/// Physical webcam behind the [`Camera`] trait.
#[derive(Default)]
pub struct WebcamCamera {
    requests: Option<mpsc::Sender<CaptureReply>>,
    worker: Option<JoinHandle<()>>,
}

impl WebcamCamera {
    pub fn new() -> Self {
        Self::default()
    }

    /// List available webcam devices.
    pub fn list_devices() -> Result<Vec<String>, CameraError> {
        let devices = nokhwa::query(nokhwa::utils::ApiBackend::Auto)
            .map_err(|e| CameraError::DeviceNotFound(e.to_string()))?;

        Ok(devices
            .into_iter()
            .map(|info| format!("{}: {}", info.index(), info.human_name()))
            .collect())
    }
}

fn open_device(config: &CaptureConfig) -> Result<nokhwa::Camera, CameraError> {
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
    let mut camera = nokhwa::Camera::new(CameraIndex::Index(config.device_id), requested)
        .map_err(|e| CameraError::OpenFailed(e.to_string()))?;
    camera
        .open_stream()
        .map_err(|e| CameraError::OpenFailed(e.to_string()))?;

    let resolution = camera.resolution();
    info!(
        "Webcam opened: {}x{} @ {:?} fps",
        resolution.width(),
        resolution.height(),
        camera.frame_rate()
    );
    Ok(camera)
}

fn read_frame(camera: &mut nokhwa::Camera, sequence: u64) -> Result<Frame, CameraError> {
    let buffer = camera
        .frame()
        .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
    let decoded = buffer
        .decode_image::<RgbFormat>()
        .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
    // nokhwa links its own `image` version, so hand over the raw buffer
    let (width, height) = (decoded.width(), decoded.height());
    Frame::from_rgb(decoded.into_raw(), width, height, sequence)
        .map_err(|e| CameraError::CaptureFailed(e.to_string()))
}

fn run_worker(
    config: CaptureConfig,
    requests: mpsc::Receiver<CaptureReply>,
    opened: std::sync::mpsc::SyncSender<Result<(), CameraError>>,
) {
    let mut camera = match open_device(&config) {
        Ok(camera) => {
            let _ = opened.send(Ok(()));
            camera
        }
        Err(e) => {
            let _ = opened.send(Err(e));
            return;
        }
    };

    let mut sequence = 0u64;
    while let Ok(reply) = requests.recv() {
        sequence += 1;
        let result = read_frame(&mut camera, sequence);
        debug!(sequence, ok = result.is_ok(), "Webcam still captured");
        // Receiver gone means the cycle was cancelled
        let _ = reply.send(result);
    }

    if let Err(e) = camera.stop_stream() {
        warn!("Failed to stop webcam stream: {}", e);
    }
    info!("Webcam worker stopped after {} frames", sequence);
}

impl Camera for WebcamCamera {
    fn open(&mut self, config: &CaptureConfig) -> Result<(), CameraError> {
        config
            .validate()
            .map_err(|e| CameraError::ConfigFailed(e.to_string()))?;
        self.close();

        let (tx, rx) = mpsc::channel();
        let (opened_tx, opened_rx) = mpsc::sync_channel(1);
        let worker_config = config.clone();
        let worker = std::thread::Builder::new()
            .name("webcam-capture".into())
            .spawn(move || run_worker(worker_config, rx, opened_tx))
            .map_err(|e| CameraError::OpenFailed(e.to_string()))?;

        opened_rx
            .recv()
            .map_err(|_| CameraError::OpenFailed("webcam worker exited".into()))??;

        self.requests = Some(tx);
        self.worker = Some(worker);
        Ok(())
    }

    fn capture(&mut self) -> impl Future<Output = Result<Frame, CameraError>> + Send {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .requests
            .as_ref()
            .map(|requests| requests.send(reply_tx).is_ok());

        async move {
            match sent {
                None => Err(CameraError::NotInitialized),
                Some(false) => Err(CameraError::CaptureFailed("webcam worker stopped".into())),
                Some(true) => reply_rx
                    .await
                    .map_err(|_| CameraError::CaptureFailed("webcam worker dropped request".into()))?,
            }
        }
    }

    fn is_open(&self) -> bool {
        self.requests.is_some()
    }

    fn close(&mut self) {
        // Dropping the sender ends the worker loop
        self.requests = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Webcam worker panicked");
            }
        }
    }
}

impl Drop for WebcamCamera {
    fn drop(&mut self) {
        self.close();
    }
}
