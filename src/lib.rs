//! Dose Verification Library
//!
//! Confirms that a patient took a scheduled dose by streaming camera
//! stills to a remote inference backend over a bidirectional event
//! socket, showing the annotated stills it returns, and recording the
//! dose once the backend reports it verified.
//!
//! # Architecture
//!
//! ```text
//! store ──resolve──▶ session ──tick──▶ capture → codec → channel ──▶ backend
//!                       ▲                                              │
//!                       └──── overlay / verified ◀── channel ◀─────────┘
//!                       │
//!                       └──▶ notify (stop alarm, dose history)
//! ```
//!
//! - [`capture`]: camera abstraction, mock and (feature `camera`) webcam
//! - [`codec`]: JPEG encoding of stills, decoding of annotated overlays
//! - [`channel`]: event vocabulary and the shared socket connection
//! - [`session`]: the verification state machine and its capture loop
//! - [`store`]: local persistence of medicines, history and login data
//! - [`notify`]: alarms and dose history
//! - [`metrics`]: Prometheus counters, HTTP exporter behind `metrics`
//!
//! # Example
//!
//! ```no_run
//! use dose_verify::{
//!     capture::{shared, Camera, MockCamera},
//!     channel::LocalChannel,
//!     config::FileConfig,
//!     metrics::MetricsRegistry,
//!     notify::LocalNotifier,
//!     session::{Phase, SessionRequest, VerificationSession},
//!     store::MemoryStore,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FileConfig::default();
//! let store = MemoryStore::new();
//!
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
//!
//! let mut updates = session.subscribe();
//! updates.wait_for(|s| s.phase == Phase::Verified).await?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod capture;
pub mod channel;
pub mod codec;
pub mod config;
pub mod metrics;
pub mod notify;
pub mod session;
pub mod store;

// Re-export commonly used types at crate root
pub use capture::{Camera, CaptureConfig, Frame, MockCamera};
pub use channel::{InboundEvent, LocalChannel, OutboundEvent, SocketChannel, SocketIoChannel};
pub use codec::{FrameCodec, OverlayImage};
pub use config::FileConfig;
pub use notify::{LocalNotifier, Notifier};
pub use session::{Phase, SessionRequest, SessionSnapshot, VerificationSession};
pub use store::{JsonFileStore, MemoryStore, Store, StoreExt};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
