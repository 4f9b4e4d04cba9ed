//! Dose verification sessions.
//!
//! A session resolves who is taking which medicine, streams camera stills
//! to the inference backend once per interval, displays the annotated
//! stills it gets back, and finishes when the backend reports the dose as
//! verified or the user cancels.
//!
//! # Example
//!
//! ```no_run
//! use dose_verify::capture::{shared, Camera, MockCamera};
//! use dose_verify::channel::LocalChannel;
//! use dose_verify::config::FileConfig;
//! use dose_verify::metrics::MetricsRegistry;
//! use dose_verify::notify::LocalNotifier;
//! use dose_verify::session::{SessionRequest, VerificationSession};
//! use dose_verify::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FileConfig::default();
//! let store = MemoryStore::new();
//! let mut camera = MockCamera::new();
//! camera.open(&config.capture)?;
//! let (channel, _backend) = LocalChannel::new();
//!
//! let session = VerificationSession::new(
//!     shared(camera),
//!     Arc::new(channel),
//!     Arc::new(LocalNotifier::new(store.clone())),
//!     &config,
//!     MetricsRegistry::new()?,
//! );
//! session.resolve(&store, &SessionRequest::new("7"))?;
//! session.start()?;
//! # Ok(())
//! # }
//! ```

mod bridge;
mod capture_loop;
mod state;

pub use bridge::{coerce_reminder_id, BridgeError};
pub use capture_loop::{CaptureCycle, CaptureLoop, CycleError};
pub use state::{
    Phase, PreconditionError, SessionError, SessionSnapshot, SessionState, SessionTarget, UiAction,
};

use crate::capture::{Camera, SharedCamera};
use crate::channel::{InboundEvent, ListenerId, OutboundEvent, SocketChannel, EVENT_SUCCESS};
use crate::codec::{AnnotatedPayload, FrameCodec};
use crate::config::{FileConfig, SessionConfig};
use crate::metrics::MetricsRegistry;
use crate::notify::{Notifier, ReminderTap};
use crate::store::{DoseStatus, Store, StoreExt};
use bridge::InboundHandler;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Navigation parameters that open a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    pub medicine_id: Option<String>,
    /// Used when the medicine record carries no reminder id.
    pub reminder_id: Option<String>,
}

impl SessionRequest {
    pub fn new(medicine_id: impl Into<String>) -> Self {
        Self {
            medicine_id: Some(medicine_id.into()),
            reminder_id: None,
        }
    }

    pub fn with_reminder(mut self, reminder_id: impl Into<String>) -> Self {
        self.reminder_id = Some(reminder_id.into());
        self
    }
}

impl From<ReminderTap> for SessionRequest {
    fn from(tap: ReminderTap) -> Self {
        Self {
            medicine_id: Some(tap.medicine_id),
            reminder_id: tap.reminder_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    UserCancelled,
    Closed,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Reads subject and medicine from local storage.
fn resolve_target<S: Store + ?Sized>(
    store: &S,
    request: &SessionRequest,
) -> Result<SessionTarget, PreconditionError> {
    let storage = |e: crate::store::StoreError| PreconditionError::Storage(e.to_string());

    let raw_uid = store
        .subject_id()
        .map_err(storage)?
        .ok_or(PreconditionError::MissingSubject)?;
    let subject_id = raw_uid
        .parse()
        .map_err(|_| PreconditionError::InvalidSubject(raw_uid.clone()))?;

    let medicine_id =
        non_blank(request.medicine_id.as_deref()).ok_or(PreconditionError::MissingMedicine)?;
    let medicine = store
        .find_medicine(medicine_id)
        .map_err(storage)?
        .ok_or_else(|| PreconditionError::MedicineNotFound(medicine_id.to_string()))?;

    let reminder_id = medicine
        .reminder()
        .or_else(|| non_blank(request.reminder_id.as_deref()))
        .map(str::to_string)
        .ok_or_else(|| PreconditionError::MissingReminder {
            medicine_id: medicine.id.clone(),
        })?;

    Ok(SessionTarget {
        subject_id,
        medicine,
        reminder_id,
    })
}

/// Silences the reminder and logs the dose as taken. Blocking.
fn record_dose<N: Notifier>(notifier: &N, medicine_id: &str) {
    if let Err(e) = notifier.stop_alarm() {
        warn!("Failed to stop alarm: {}", e);
    }
    if let Err(e) = notifier.add_to_history(medicine_id, DoseStatus::Taken) {
        warn!("Failed to record dose: {}", e);
    }
}

struct SessionCore<C, K, N> {
    state: Mutex<SessionState>,
    capture: Mutex<CaptureLoop>,
    listener: Mutex<Option<ListenerId>>,
    camera: SharedCamera<C>,
    channel: Arc<K>,
    notifier: Arc<N>,
    codec: FrameCodec,
    config: SessionConfig,
    metrics: MetricsRegistry,
    updates: watch::Sender<SessionSnapshot>,
    /// Parent of every task the session spawns.
    lifetime: CancellationToken,
}

impl<C, K, N> SessionCore<C, K, N>
where
    C: Camera,
    K: SocketChannel,
    N: Notifier,
{
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_capture(&self) -> MutexGuard<'_, CaptureLoop> {
        self.capture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &SessionState) {
        self.updates.send_replace(state.snapshot());
    }

    async fn capture_and_send(&self, run: u64) -> Result<(), CycleError> {
        let frame = {
            let mut camera = self.camera.lock().await;
            camera.capture().await?
        };
        self.metrics.frame_captured();
        let encoded = self.codec.encode_async(frame).await?;

        let mut state = self.lock_state();
        if !state.accepts_frames(run) {
            debug!(run, "Discarding frame from stale capture cycle");
            self.metrics.frame_dropped();
            return Ok(());
        }
        let Some(target) = state.target() else {
            return Ok(());
        };

        let message = match bridge::frame_message(target, encoded) {
            Ok(message) => message,
            Err(e) => {
                warn!(medicine = %target.medicine.id, "Dropping frame: {}", e);
                self.metrics.frame_dropped();
                return Ok(());
            }
        };
        let (uid, rid, bytes) = (message.uid, message.rid, message.frame.len());

        match self.channel.emit(OutboundEvent::RawFrame(message)) {
            Ok(()) => {
                let sequence = state.record_sent();
                self.metrics.frame_sent();
                debug!(sequence, uid, rid, bytes, "Frame sent");
                self.publish(&state);
            }
            Err(e) => {
                self.metrics.frame_dropped();
                debug!("Frame not delivered: {}", e);
            }
        }
        Ok(())
    }

    fn on_connection(&self, connected: bool) {
        let mut state = self.lock_state();
        if state.set_connected(connected) {
            self.metrics.set_connected(connected);
            if connected {
                info!("Socket connected");
            } else {
                warn!("Socket disconnected");
            }
            self.publish(&state);
        }
    }

    fn on_annotated(&self, payload: &AnnotatedPayload) {
        if !self.lock_state().phase().is_active() {
            trace!("Ignoring annotated frame outside capture");
            return;
        }

        match self.codec.decode_overlay(payload) {
            Ok(image) => {
                let bytes = image.byte_len();
                let mut state = self.lock_state();
                if state.apply_overlay(Arc::new(image)) {
                    self.metrics.overlay_received();
                    trace!(bytes, "Overlay updated");
                    self.publish(&state);
                }
            }
            Err(e) => {
                self.metrics.overlay_rejected();
                debug!("Rejected annotated frame: {}", e);
            }
        }
    }

    fn on_verified(self: Arc<Self>) {
        let target = {
            let mut state = self.lock_state();
            if !state.verify() {
                debug!(phase = %state.phase(), "Ignoring verification");
                return;
            }
            self.publish(&state);
            state.target().cloned()
        };
        self.lock_capture().stop();
        self.metrics.verified();

        let medicine_id = target.map(|target| {
            info!(
                uid = target.subject_id,
                medicine = %target.medicine.id,
                "Dose verified"
            );
            target.medicine.id
        });
        self.finish_verified(medicine_id);
    }

    /// Records the dose off the listener task, then navigates away after
    /// the configured delay unless the session is torn down first.
    fn finish_verified(self: Arc<Self>, medicine_id: Option<String>) {
        let token = self.lifetime.child_token();
        let deadline = Instant::now() + self.config.navigate_delay();
        tokio::spawn(async move {
            if let Some(medicine_id) = medicine_id {
                let notifier = Arc::clone(&self.notifier);
                let recorded =
                    task::spawn_blocking(move || record_dose(&*notifier, &medicine_id));
                if let Err(e) = recorded.await {
                    warn!("Dose recording task failed: {}", e);
                }
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => trace!("Navigation cancelled"),
                _ = sleep_until(deadline) => {
                    let mut state = self.lock_state();
                    if state.request_navigation() {
                        debug!("Leaving verified session");
                        self.publish(&state);
                    }
                }
            }
        });
    }

    fn teardown(&self, reason: StopReason) {
        let (stopped_while_active, target) = {
            let mut state = self.lock_state();
            let was_active = state.phase().is_active();
            if !state.stop() {
                (None, None)
            } else {
                self.publish(&state);
                (Some(was_active), state.target().cloned())
            }
        };

        self.lock_capture().stop();
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = listener {
            self.channel.detach(id);
        }
        self.lifetime.cancel();

        let Some(was_active) = stopped_while_active else {
            return;
        };
        self.metrics.session_cancelled();
        info!(?reason, "Session stopped");

        if reason == StopReason::UserCancelled && was_active && self.config.report_unverified_on_cancel
        {
            self.report_unverified(target);
        }
    }

    fn report_unverified(&self, target: Option<SessionTarget>) {
        let Some(target) = target else {
            return;
        };
        let report = match bridge::dose_report(&target) {
            Ok(report) => report,
            Err(e) => {
                warn!("Not reporting unverified dose: {}", e);
                return;
            }
        };
        if let Err(e) = self.channel.emit(OutboundEvent::NotVerified(report)) {
            warn!("Failed to report unverified dose: {}", e);
        }
    }
}

impl<C, K, N> CaptureCycle for SessionCore<C, K, N>
where
    C: Camera,
    K: SocketChannel,
    N: Notifier,
{
    fn begin_cycle(&self) -> Option<u64> {
        self.lock_state().try_begin_cycle()
    }

    fn run_cycle(&self, run: u64) -> impl Future<Output = Result<(), CycleError>> + Send {
        async move {
            let result = self.capture_and_send(run).await;
            if result.is_err() {
                self.metrics.capture_failed();
            }
            result
        }
    }

    fn end_cycle(&self, run: u64) {
        self.lock_state().finish_cycle(run);
    }

    fn tick_skipped(&self) {
        self.metrics.tick_skipped();
    }
}

impl<C, K, N> InboundHandler for SessionCore<C, K, N>
where
    C: Camera,
    K: SocketChannel,
    N: Notifier,
{
    fn handle(self: Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::Connected => self.on_connection(true),
            InboundEvent::Disconnected => self.on_connection(false),
            InboundEvent::AnnotatedFrame(payload) => self.on_annotated(&payload),
            InboundEvent::Verified => self.on_verified(),
            InboundEvent::Notice { event, message } if event == EVENT_SUCCESS => {
                info!(%event, "{}", message)
            }
            InboundEvent::Notice { event, message } => warn!(%event, "{}", message),
        }
    }
}

/// One attempt to verify one dose.
///
/// Dropping the session closes it.
pub struct VerificationSession<C, K, N>
where
    C: Camera,
    K: SocketChannel,
    N: Notifier,
{
    core: Arc<SessionCore<C, K, N>>,
}

impl<C, K, N> VerificationSession<C, K, N>
where
    C: Camera,
    K: SocketChannel,
    N: Notifier,
{
    pub fn new(
        camera: SharedCamera<C>,
        channel: Arc<K>,
        notifier: Arc<N>,
        config: &FileConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        let connected = channel.is_connected();
        metrics.set_connected(connected);
        let state = SessionState::new(connected);
        let (updates, _) = watch::channel(state.snapshot());

        let core = SessionCore {
            state: Mutex::new(state),
            capture: Mutex::new(CaptureLoop::new(config.capture.interval())),
            listener: Mutex::new(None),
            camera,
            channel,
            notifier,
            codec: FrameCodec::new(&config.capture, config.session.min_overlay_bytes),
            config: config.session.clone(),
            metrics,
            updates,
            lifetime: CancellationToken::new(),
        };
        Self {
            core: Arc::new(core),
        }
    }

    /// Resolves subject and medicine and attaches the socket listener.
    ///
    /// On a precondition failure the session stays idle with the error in
    /// its snapshot and nothing is subscribed.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoRuntime`] when called outside a tokio runtime,
    /// since the listener runs as a task. The session is left untouched.
    pub fn resolve<S: Store + ?Sized>(
        &self,
        store: &S,
        request: &SessionRequest,
    ) -> Result<(), SessionError> {
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let target = match resolve_target(store, request) {
            Ok(target) => target,
            Err(e) => {
                warn!("Cannot verify dose: {}", e);
                let mut state = self.core.lock_state();
                state.fail_precondition(e.clone())?;
                self.core.publish(&state);
                return Err(e.into());
            }
        };

        {
            let mut state = self.core.lock_state();
            let (uid, medicine_id) = (target.subject_id, target.medicine.id.clone());
            state.resolve(target)?;
            info!(uid, medicine = %medicine_id, "Session ready");
            self.core.publish(&state);
        }

        let subscription = self.core.channel.subscribe();
        *self
            .core
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription.id);
        runtime.spawn(bridge::run_listener(
            subscription.events,
            Arc::clone(&self.core),
            self.core.lifetime.child_token(),
        ));
        Ok(())
    }

    /// Starts the capture loop.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoRuntime`] outside a tokio runtime, otherwise
    /// [`SessionError::InvalidTransition`] unless the session is ready.
    pub fn start(&self) -> Result<(), SessionError> {
        Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        {
            let mut state = self.core.lock_state();
            let run = state.begin_capture()?;
            debug!(run, "Capture run started");
            self.core.publish(&state);
        }
        self.core.metrics.session_started();
        self.core
            .lock_capture()
            .start(Arc::clone(&self.core), &self.core.lifetime);
        Ok(())
    }

    /// User-initiated stop. Idempotent.
    pub fn cancel(&self) {
        self.core.teardown(StopReason::UserCancelled);
    }

    /// Tears the session down. Idempotent.
    pub fn close(&self) {
        self.core.teardown(StopReason::Closed);
    }

    pub fn phase(&self) -> Phase {
        self.core.lock_state().phase()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.core.lock_state().snapshot()
    }

    /// Stream of snapshots for the view layer.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.core.updates.subscribe()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.core.metrics
    }
}

impl<C, K, N> Drop for VerificationSession<C, K, N>
where
    C: Camera,
    K: SocketChannel,
    N: Notifier,
{
    fn drop(&mut self) {
        self.close();
    }
}
