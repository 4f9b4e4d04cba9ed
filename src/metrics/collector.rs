//! Metrics collection and registry.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_cancelled: u64,
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub ticks_skipped: u64,
    pub capture_failures: u64,
    pub overlays_received: u64,
    pub overlays_rejected: u64,
    pub verifications: u64,
    pub socket_connected: bool,
}

/// Prometheus metrics registry for verification sessions.
///
/// Cloning is cheap; clones update the same underlying metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,

    // Session lifecycle
    sessions_started: IntCounter,
    sessions_cancelled: IntCounter,
    verifications: IntCounter,

    // Capture loop
    frames_captured: IntCounter,
    frames_sent: IntCounter,
    frames_dropped: IntCounter,
    ticks_skipped: IntCounter,
    capture_failures: IntCounter,

    // Inbound overlays
    overlays_received: IntCounter,
    overlays_rejected: IntCounter,

    socket_connected: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, MetricsError> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl MetricsRegistry {
    /// Creates a new registry with all session metrics registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let sessions_started = counter(
            &registry,
            "dose_verify_sessions_started_total",
            "Verification sessions that started capturing",
        )?;
        let sessions_cancelled = counter(
            &registry,
            "dose_verify_sessions_cancelled_total",
            "Verification sessions stopped before verification",
        )?;
        let verifications = counter(
            &registry,
            "dose_verify_verifications_total",
            "Doses verified by the backend",
        )?;
        let frames_captured = counter(
            &registry,
            "dose_verify_frames_captured_total",
            "Stills read from the camera",
        )?;
        let frames_sent = counter(
            &registry,
            "dose_verify_frames_sent_total",
            "Frames emitted to the backend",
        )?;
        let frames_dropped = counter(
            &registry,
            "dose_verify_frames_dropped_total",
            "Encoded frames not delivered (bad reminder id, socket down, stale cycle)",
        )?;
        let ticks_skipped = counter(
            &registry,
            "dose_verify_ticks_skipped_total",
            "Capture ticks skipped because a cycle was in flight",
        )?;
        let capture_failures = counter(
            &registry,
            "dose_verify_capture_failures_total",
            "Capture cycles failed on camera read or encode",
        )?;
        let overlays_received = counter(
            &registry,
            "dose_verify_overlays_received_total",
            "Annotated frames accepted for display",
        )?;
        let overlays_rejected = counter(
            &registry,
            "dose_verify_overlays_rejected_total",
            "Annotated frames rejected as corrupt or undersized",
        )?;

        let socket_connected = IntGauge::new(
            "dose_verify_socket_connected",
            "Socket connection state (1=connected, 0=disconnected)",
        )?;
        registry.register(Box::new(socket_connected.clone()))?;

        Ok(Self {
            registry,
            sessions_started,
            sessions_cancelled,
            verifications,
            frames_captured,
            frames_sent,
            frames_dropped,
            ticks_skipped,
            capture_failures,
            overlays_received,
            overlays_rejected,
            socket_connected,
        })
    }

    pub fn session_started(&self) {
        self.sessions_started.inc();
    }

    pub fn session_cancelled(&self) {
        self.sessions_cancelled.inc();
    }

    pub fn verified(&self) {
        self.verifications.inc();
    }

    pub fn frame_captured(&self) {
        self.frames_captured.inc();
    }

    pub fn frame_sent(&self) {
        self.frames_sent.inc();
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.inc();
    }

    pub fn tick_skipped(&self) {
        self.ticks_skipped.inc();
    }

    pub fn capture_failed(&self) {
        self.capture_failures.inc();
    }

    pub fn overlay_received(&self) {
        self.overlays_received.inc();
    }

    pub fn overlay_rejected(&self) {
        self.overlays_rejected.inc();
    }

    pub fn set_connected(&self, connected: bool) {
        self.socket_connected.set(if connected { 1 } else { 0 });
    }

    /// Reads the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_started: self.sessions_started.get(),
            sessions_cancelled: self.sessions_cancelled.get(),
            frames_captured: self.frames_captured.get(),
            frames_sent: self.frames_sent.get(),
            frames_dropped: self.frames_dropped.get(),
            ticks_skipped: self.ticks_skipped.get(),
            capture_failures: self.capture_failures.get(),
            overlays_received: self.overlays_received.get(),
            overlays_rejected: self.overlays_rejected.get(),
            verifications: self.verifications.get(),
            socket_connected: self.socket_connected.get() == 1,
        }
    }

    /// Returns the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MetricsRegistry").field(&self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creation() {
        let registry = MetricsRegistry::new();
        assert!(registry.is_ok());
    }

    #[test]
    fn test_clones_share_counters() {
        let registry = MetricsRegistry::new().unwrap();
        let clone = registry.clone();

        clone.frame_sent();
        clone.frame_sent();
        clone.tick_skipped();
        clone.set_connected(true);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.ticks_skipped, 1);
        assert!(snapshot.socket_connected);
    }

    #[test]
    fn test_metrics_encode() {
        let registry = MetricsRegistry::new().unwrap();
        registry.verified();
        let output = registry.encode().unwrap();

        assert!(output.contains("dose_verify_verifications_total 1"));
        assert!(output.contains("dose_verify_frames_sent_total"));
        assert!(output.contains("dose_verify_socket_connected"));
    }
}
