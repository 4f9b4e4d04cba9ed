//! Periodic capture loop.
//!
//! Ticks on a fixed interval. Each tick claims the driver's in-flight
//! slot and runs one capture cycle as its own task; a tick that finds a
//! cycle still in flight is skipped, never queued.

use crate::capture::CameraError;
use crate::codec::CodecError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Why a capture cycle produced no frame.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("camera read failed: {0}")]
    Camera(#[from] CameraError),
    #[error("frame encoding failed: {0}")]
    Codec(#[from] CodecError),
}

/// Work performed on each tick.
pub trait CaptureCycle: Send + Sync + 'static {
    /// Claims the in-flight slot. `None` skips this tick.
    fn begin_cycle(&self) -> Option<u64>;

    /// Captures, encodes and sends one frame for capture run `run`.
    fn run_cycle(&self, run: u64) -> impl Future<Output = Result<(), CycleError>> + Send;

    /// Releases the in-flight slot. Called even when the cycle is cancelled.
    fn end_cycle(&self, run: u64);

    fn tick_skipped(&self) {}
}

/// Handle to a running capture loop.
#[derive(Debug)]
pub struct CaptureLoop {
    interval: Duration,
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureLoop {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            token: None,
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.token.is_some()
    }

    /// Starts ticking. A loop that is already running is left alone.
    ///
    /// The loop stops on [`CaptureLoop::stop`] or when `parent` is cancelled.
    pub fn start<D: CaptureCycle>(&mut self, driver: Arc<D>, parent: &CancellationToken) -> bool {
        if self.is_running() {
            debug!("Capture loop already running");
            return false;
        }

        let token = parent.child_token();
        self.handle = Some(tokio::spawn(run_loop(driver, self.interval, token.clone())));
        self.token = Some(token);
        debug!(interval_ms = self.interval.as_millis() as u64, "Capture loop started");
        true
    }

    /// Stops ticking and cancels any in-flight cycle. Safe to call repeatedly
    /// and before [`CaptureLoop::start`].
    pub fn stop(&mut self) -> bool {
        let Some(token) = self.token.take() else {
            return false;
        };
        token.cancel();
        self.handle = None;
        debug!("Capture loop stopped");
        true
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop<D: CaptureCycle>(driver: Arc<D>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                trace!("Capture loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                let Some(run) = driver.begin_cycle() else {
                    trace!("Previous capture still in flight, skipping tick");
                    driver.tick_skipped();
                    continue;
                };
                tokio::spawn(run_cycle(Arc::clone(&driver), run, token.clone()));
            }
        }
    }
}

async fn run_cycle<D: CaptureCycle>(driver: Arc<D>, run: u64, token: CancellationToken) {
    tokio::select! {
        biased;
        _ = token.cancelled() => debug!(run, "In-flight capture cancelled"),
        result = driver.run_cycle(run) => {
            if let Err(e) = result {
                warn!(run, "Capture cycle failed: {}", e);
            }
        }
    }
    driver.end_cycle(run);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct FakeDriver {
        in_flight: AtomicBool,
        started: AtomicUsize,
        completed: AtomicUsize,
        ended: AtomicUsize,
        skipped: AtomicU64,
        failures_left: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
    }

    impl CaptureCycle for FakeDriver {
        fn begin_cycle(&self) -> Option<u64> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                return None;
            }
            Some(1)
        }

        fn run_cycle(&self, _run: u64) -> impl Future<Output = Result<(), CycleError>> + Send {
            async move {
                self.started.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = &self.gate {
                    gate.acquire().await.unwrap().forget();
                }
                let failing = self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(CameraError::CaptureFailed("flaky".into()).into());
                }
                self.completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        fn end_cycle(&self, _run: u64) {
            self.ended.fetch_add(1, Ordering::SeqCst);
            self.in_flight.store(false, Ordering::SeqCst);
        }

        fn tick_skipped(&self) {
            self.skipped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_interval() {
        let driver = Arc::new(FakeDriver::default());
        let root = CancellationToken::new();
        let mut capture = CaptureLoop::new(Duration::from_secs(1));

        assert!(capture.start(Arc::clone(&driver), &root));
        tokio::time::sleep(Duration::from_millis(3500)).await;

        // Ticks at 0, 1, 2 and 3 seconds.
        assert_eq!(driver.completed.load(Ordering::SeqCst), 4);
        assert_eq!(driver.skipped.load(Ordering::SeqCst), 0);
        capture.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_noop() {
        let driver = Arc::new(FakeDriver::default());
        let root = CancellationToken::new();
        let mut capture = CaptureLoop::new(Duration::from_secs(1));

        assert!(capture.start(Arc::clone(&driver), &root));
        assert!(!capture.start(Arc::clone(&driver), &root));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(driver.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_safe_before_start() {
        let mut capture = CaptureLoop::new(Duration::from_secs(1));
        assert!(!capture.stop());

        let driver = Arc::new(FakeDriver::default());
        capture.start(driver, &CancellationToken::new());
        assert!(capture.stop());
        assert!(!capture.stop());
        assert!(!capture.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycle_skips_ticks() {
        let gate = Arc::new(Semaphore::new(0));
        let driver = Arc::new(FakeDriver {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let mut capture = CaptureLoop::new(Duration::from_secs(1));
        capture.start(Arc::clone(&driver), &CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(driver.started.load(Ordering::SeqCst), 1);
        assert_eq!(driver.skipped.load(Ordering::SeqCst), 4);

        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(driver.completed.load(Ordering::SeqCst), 1);
        assert_eq!(driver.started.load(Ordering::SeqCst), 2);
        capture.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_loop() {
        let driver = Arc::new(FakeDriver {
            failures_left: AtomicUsize::new(2),
            ..Default::default()
        });
        let mut capture = CaptureLoop::new(Duration::from_secs(1));
        capture.start(Arc::clone(&driver), &CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(driver.started.load(Ordering::SeqCst), 4);
        assert_eq!(driver.completed.load(Ordering::SeqCst), 2);
        capture.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_in_flight_cycle() {
        let gate = Arc::new(Semaphore::new(0));
        let driver = Arc::new(FakeDriver {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let mut capture = CaptureLoop::new(Duration::from_secs(1));
        capture.start(Arc::clone(&driver), &CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(100)).await;

        capture.stop();
        gate.add_permits(10);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(driver.started.load(Ordering::SeqCst), 1);
        assert_eq!(driver.completed.load(Ordering::SeqCst), 0);
        assert_eq!(driver.ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_loop() {
        let driver = Arc::new(FakeDriver::default());
        let root = CancellationToken::new();
        let mut capture = CaptureLoop::new(Duration::from_secs(1));
        capture.start(Arc::clone(&driver), &root);
        tokio::time::sleep(Duration::from_millis(100)).await;

        root.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(driver.started.load(Ordering::SeqCst), 1);
    }
}
