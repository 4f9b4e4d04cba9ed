//! Prometheus metrics for verification sessions.
//!
//! # Metrics Exposed
//!
//! ## Session Metrics
//! - `dose_verify_sessions_started_total` - Sessions that started capturing
//! - `dose_verify_sessions_cancelled_total` - Sessions stopped before verification
//! - `dose_verify_verifications_total` - Doses verified
//!
//! ## Capture Loop Metrics
//! - `dose_verify_frames_captured_total` - Stills read from the camera
//! - `dose_verify_frames_sent_total` - Frames emitted to the backend
//! - `dose_verify_frames_dropped_total` - Encoded frames not delivered
//! - `dose_verify_ticks_skipped_total` - Ticks skipped while a cycle was in flight
//! - `dose_verify_capture_failures_total` - Failed camera reads or encodes
//!
//! ## Overlay Metrics
//! - `dose_verify_overlays_received_total` - Annotated frames displayed
//! - `dose_verify_overlays_rejected_total` - Annotated frames rejected
//!
//! ## Connection
//! - `dose_verify_socket_connected` - 1 while the socket is connected
//!
//! # Example
//!
//! ```no_run
//! use dose_verify::metrics::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new().expect("Failed to create registry");
//! registry.frame_sent();
//! println!("{}", registry.encode().unwrap());
//! ```

mod collector;
#[cfg(feature = "metrics")]
mod server;

pub use collector::{MetricsError, MetricsRegistry, MetricsSnapshot};
#[cfg(feature = "metrics")]
pub use server::{MetricsServer, MetricsServerConfig, ServerError};
