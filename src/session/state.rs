//! Verification session state machine.
//!
//! Pure state: no timers, no I/O. The session wraps it in a mutex and
//! every transition is checked and applied synchronously under that lock.
//!
//! ```text
//! idle ──resolve──▶ ready ──start──▶ capturing ──overlay──▶ overlay ─┐
//!                     │                  │                     ▲   │ overlay
//!                     │                  │                     └───┘
//!                     │                  └──────verify─────▶ verified
//!                     └─────────── stop (any non-terminal) ─▶ stopped
//! ```

use crate::codec::OverlayImage;
use crate::store::Medicine;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Subject or medicine not resolved yet.
    #[default]
    Idle,
    /// Resolved, capture not started.
    Ready,
    /// Capture loop running, no overlay received yet.
    Capturing,
    /// Capture loop running, showing the latest annotated frame.
    Overlay,
    /// Dose verified. Terminal.
    Verified,
    /// Cancelled or closed. Terminal.
    Stopped,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Stopped)
    }

    /// True while frames are being captured.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Capturing | Self::Overlay)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Capturing => "capturing",
            Self::Overlay => "overlay",
            Self::Verified => "verified",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why a session could not become ready. The UI can only go back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("no logged-in user")]
    MissingSubject,
    #[error("user id {0:?} is not numeric")]
    InvalidSubject(String),
    #[error("no medicine selected")]
    MissingMedicine,
    #[error("medicine {0} not found")]
    MedicineNotFound(String),
    #[error("medicine {medicine_id} has no reminder")]
    MissingReminder { medicine_id: String },
    #[error("local storage unavailable: {0}")]
    Storage(String),
}

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {action} while {from}")]
    InvalidTransition { from: Phase, action: &'static str },
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error("session tasks need a running tokio runtime")]
    NoRuntime,
}

/// Who and what a session verifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub subject_id: u64,
    pub medicine: Medicine,
    /// Reminder id as stored; coerced to a number per outbound frame.
    pub reminder_id: String,
}

/// Actions the view may offer in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UiAction {
    Start,
    Cancel,
    GoBack,
}

/// What the view layer renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub frame_sequence: u64,
    pub overlay: Option<Arc<OverlayImage>>,
    pub connected: bool,
    pub error: Option<PreconditionError>,
    /// Set once the verified state has been shown long enough.
    pub navigate_back: bool,
}

impl SessionSnapshot {
    pub fn actions(&self) -> &'static [UiAction] {
        match self.phase {
            Phase::Idle if self.error.is_some() => &[UiAction::GoBack],
            Phase::Idle => &[],
            Phase::Ready => &[UiAction::Start, UiAction::Cancel],
            Phase::Capturing | Phase::Overlay => &[UiAction::Cancel],
            Phase::Verified => &[],
            Phase::Stopped => &[UiAction::GoBack],
        }
    }
}

/// Mutable session state.
#[derive(Debug, Default)]
pub struct SessionState {
    phase: Phase,
    target: Option<SessionTarget>,
    frame_sequence: u64,
    last_overlay: Option<Arc<OverlayImage>>,
    /// Re-entrancy guard of the capture loop.
    capture_in_flight: bool,
    /// Capture run generation; bumped on start and on leaving the active phases.
    run: u64,
    connected: bool,
    error: Option<PreconditionError>,
    navigate_back: bool,
}

impl SessionState {
    pub fn new(connected: bool) -> Self {
        Self {
            connected,
            ..Default::default()
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn target(&self) -> Option<&SessionTarget> {
        self.target.as_ref()
    }

    pub fn frame_sequence(&self) -> u64 {
        self.frame_sequence
    }

    pub fn last_overlay(&self) -> Option<&Arc<OverlayImage>> {
        self.last_overlay.as_ref()
    }

    pub fn is_capture_in_flight(&self) -> bool {
        self.capture_in_flight
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidTransition {
            from: self.phase,
            action,
        }
    }

    /// `idle → ready`.
    pub fn resolve(&mut self, target: SessionTarget) -> Result<(), SessionError> {
        if self.phase != Phase::Idle {
            return Err(self.invalid("resolve"));
        }
        self.target = Some(target);
        self.error = None;
        self.phase = Phase::Ready;
        Ok(())
    }

    /// Records a precondition failure; the machine stays idle.
    pub fn fail_precondition(&mut self, error: PreconditionError) -> Result<(), SessionError> {
        if self.phase != Phase::Idle {
            return Err(self.invalid("fail precondition"));
        }
        self.error = Some(error);
        Ok(())
    }

    /// `ready → capturing`. Returns the new run generation.
    pub fn begin_capture(&mut self) -> Result<u64, SessionError> {
        if self.phase != Phase::Ready {
            return Err(self.invalid("start capture"));
        }
        self.phase = Phase::Capturing;
        self.frame_sequence = 0;
        self.last_overlay = None;
        self.capture_in_flight = false;
        self.run += 1;
        Ok(self.run)
    }

    /// Claims the in-flight slot for a capture cycle.
    ///
    /// Returns `None` if a cycle is already in flight or capture is not
    /// active; the caller skips its tick.
    pub fn try_begin_cycle(&mut self) -> Option<u64> {
        if !self.phase.is_active() || self.capture_in_flight {
            return None;
        }
        self.capture_in_flight = true;
        Some(self.run)
    }

    /// Releases the in-flight slot. Stale runs leave the current guard alone.
    pub fn finish_cycle(&mut self, run: u64) {
        if run == self.run {
            self.capture_in_flight = false;
        }
    }

    /// Whether a cycle of `run` may still send its frame.
    pub fn accepts_frames(&self, run: u64) -> bool {
        self.phase.is_active() && run == self.run
    }

    /// Counts a sent frame and returns its sequence number.
    pub fn record_sent(&mut self) -> u64 {
        self.frame_sequence += 1;
        self.frame_sequence
    }

    /// `capturing|overlay → overlay`, replacing the previous overlay.
    /// Returns false (and discards the frame) outside the active phases.
    pub fn apply_overlay(&mut self, overlay: Arc<OverlayImage>) -> bool {
        if !self.phase.is_active() {
            return false;
        }
        self.last_overlay = Some(overlay);
        self.phase = Phase::Overlay;
        true
    }

    /// `capturing|overlay → verified`. Returns false if ignored.
    pub fn verify(&mut self) -> bool {
        if !self.phase.is_active() {
            return false;
        }
        self.phase = Phase::Verified;
        self.capture_in_flight = false;
        self.run += 1;
        true
    }

    /// Any non-terminal phase `→ stopped`. Returns false if already terminal.
    pub fn stop(&mut self) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.phase = Phase::Stopped;
        self.last_overlay = None;
        self.capture_in_flight = false;
        self.run += 1;
        true
    }

    /// Updates the connection flag. Returns true if it changed.
    pub fn set_connected(&mut self, connected: bool) -> bool {
        if self.phase.is_terminal() || self.connected == connected {
            return false;
        }
        self.connected = connected;
        true
    }

    /// Marks a verified session ready to navigate away.
    pub fn request_navigation(&mut self) -> bool {
        if self.phase != Phase::Verified || self.navigate_back {
            return false;
        }
        self.navigate_back = true;
        true
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            frame_sequence: self.frame_sequence,
            overlay: self.last_overlay.clone(),
            connected: self.connected,
            error: self.error.clone(),
            navigate_back: self.navigate_back,
        }
    }
}
