//! Bidirectional event channel to the inference backend.
//!
//! The socket connection is shared process-wide and outlives sessions.
//! Sessions register a listener when they become ready and detach it on
//! teardown; they never close the connection.
//!
//! [`SocketIoChannel`] talks to the real backend. [`LocalChannel`] keeps
//! everything in process, with a [`BackendEndpoint`] standing in for the
//! server.

mod socketio;

pub use socketio::SocketIoChannel;

use crate::codec::AnnotatedPayload;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Outbound still for inference.
pub const EVENT_RAW_FRAME: &str = "raw_frame";
/// Outbound report of an abandoned verification attempt.
pub const EVENT_NOT_VERIFIED: &str = "not verified";
/// Inbound annotated still.
pub const EVENT_ANNOTATED_FRAME: &str = "annotated_frame";
/// Inbound verification success.
pub const EVENT_VERIFIED: &str = "verified";
pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_APP_ERROR: &str = "app_error";
pub const EVENT_SUCCESS: &str = "success";

/// Errors that can occur on the event channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("socket disconnected")]
    Disconnected,
    #[error("socket channel closed")]
    Closed,
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("malformed {event} payload")]
    MalformedPayload { event: String },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("socket transport error: {0}")]
    Transport(String),
}

/// `raw_frame` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawFrameMessage {
    pub uid: u64,
    pub rid: u64,
    /// Encoded JPEG bytes.
    pub frame: Vec<u8>,
}

/// `{ uid, rid }` payload of dose outcome reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DoseReport {
    pub uid: u64,
    pub rid: u64,
}

/// Events sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    RawFrame(RawFrameMessage),
    NotVerified(DoseReport),
}

impl OutboundEvent {
    /// Wire event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RawFrame(_) => EVENT_RAW_FRAME,
            Self::NotVerified(_) => EVENT_NOT_VERIFIED,
        }
    }

    /// Wire payload.
    pub fn to_json(&self) -> Result<Value, ChannelError> {
        let value = match self {
            Self::RawFrame(message) => serde_json::to_value(message)?,
            Self::NotVerified(report) => serde_json::to_value(report)?,
        };
        Ok(value)
    }
}

/// Events received from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Connected,
    Disconnected,
    AnnotatedFrame(AnnotatedPayload),
    Verified,
    /// `error`, `app_error` and `success` notices; informational only.
    Notice { event: String, message: String },
}

impl InboundEvent {
    /// Decodes an event from its wire name and JSON payload.
    pub fn from_wire(name: &str, payload: Value) -> Result<Self, ChannelError> {
        match name {
            EVENT_CONNECT => Ok(Self::Connected),
            EVENT_DISCONNECT => Ok(Self::Disconnected),
            EVENT_VERIFIED => Ok(Self::Verified),
            EVENT_ANNOTATED_FRAME => annotated_payload(payload)
                .map(Self::AnnotatedFrame)
                .ok_or_else(|| ChannelError::MalformedPayload {
                    event: name.to_string(),
                }),
            EVENT_ERROR | EVENT_APP_ERROR | EVENT_SUCCESS => Ok(Self::Notice {
                event: name.to_string(),
                message: notice_message(payload),
            }),
            other => Err(ChannelError::UnknownEvent(other.to_string())),
        }
    }
}

fn annotated_payload(payload: Value) -> Option<AnnotatedPayload> {
    match payload {
        Value::String(text) => Some(AnnotatedPayload::Text(text)),
        Value::Array(items) => items
            .into_iter()
            .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect::<Option<Vec<u8>>>()
            .map(AnnotatedPayload::Bytes),
        Value::Object(mut fields) => Some(AnnotatedPayload::Envelope {
            frame: match fields.remove("frame") {
                Some(Value::String(frame)) => Some(frame),
                _ => None,
            },
        }),
        _ => None,
    }
}

fn notice_message(payload: Value) -> String {
    match payload {
        Value::String(message) => message,
        Value::Object(ref fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}

/// Identifies one listener registration on a channel.
pub type ListenerId = u64;

/// A listener registration and its event stream.
#[derive(Debug)]
pub struct Subscription {
    pub id: ListenerId,
    pub events: mpsc::UnboundedReceiver<InboundEvent>,
}

/// Shared socket connection as seen by a session.
pub trait SocketChannel: Send + Sync + 'static {
    /// Sends one event. Fails without retry when the socket is down.
    fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError>;

    /// Registers a listener for inbound events.
    fn subscribe(&self) -> Subscription;

    /// Removes a listener. Returns false if it was already detached.
    fn detach(&self, id: ListenerId) -> bool;

    fn is_connected(&self) -> bool;
}

/// Listener registry and connection flag behind every channel.
struct Hub {
    listeners: Mutex<HashMap<ListenerId, mpsc::UnboundedSender<InboundEvent>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    outbound: mpsc::UnboundedSender<OutboundEvent>,
}

impl Hub {
    fn new(connected: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(connected),
            outbound: tx,
        };
        (Arc::new(hub), rx)
    }

    fn lock_listeners(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ListenerId, mpsc::UnboundedSender<InboundEvent>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, event: InboundEvent) -> usize {
        self.lock_listeners()
            .values()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }

    /// Flips the connection flag, notifying listeners on change.
    fn set_connected(&self, connected: bool) -> bool {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was == connected {
            return false;
        }
        self.broadcast(if connected {
            InboundEvent::Connected
        } else {
            InboundEvent::Disconnected
        });
        true
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }
        tracing::trace!(event = event.name(), "Emitting socket event");
        self.outbound.send(event).map_err(|_| ChannelError::Closed)
    }

    fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_listeners().insert(id, tx);
        tracing::debug!(listener = id, "Socket listener attached");
        Subscription { id, events: rx }
    }

    fn detach(&self, id: ListenerId) -> bool {
        let removed = self.lock_listeners().remove(&id).is_some();
        if removed {
            tracing::debug!(listener = id, "Socket listener detached");
        }
        removed
    }

    fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }
}

/// In-process socket connection.
///
/// Stands in for the network transport: the [`BackendEndpoint`] half
/// observes emitted events and pushes inbound ones.
#[derive(Clone)]
pub struct LocalChannel {
    hub: Arc<Hub>,
}

/// Backend side of a [`LocalChannel`].
pub struct BackendEndpoint {
    hub: Arc<Hub>,
    outbound: mpsc::UnboundedReceiver<OutboundEvent>,
}

impl LocalChannel {
    /// Creates a connected channel and its backend half.
    pub fn new() -> (Self, BackendEndpoint) {
        let (hub, outbound) = Hub::new(true);
        (
            Self {
                hub: Arc::clone(&hub),
            },
            BackendEndpoint { hub, outbound },
        )
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.hub.listener_count()
    }
}

impl SocketChannel for LocalChannel {
    fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        self.hub.emit(event)
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn detach(&self, id: ListenerId) -> bool {
        self.hub.detach(id)
    }

    fn is_connected(&self) -> bool {
        self.hub.is_connected()
    }
}

impl BackendEndpoint {
    /// Delivers an event to every listener. Returns the number reached.
    pub fn push(&self, event: InboundEvent) -> usize {
        self.hub.broadcast(event)
    }

    /// Decodes and delivers a wire event.
    pub fn push_wire(&self, name: &str, payload: Value) -> Result<usize, ChannelError> {
        Ok(self.push(InboundEvent::from_wire(name, payload)?))
    }

    /// Flips the connection state and notifies listeners.
    pub fn set_connected(&self, connected: bool) {
        self.hub.set_connected(connected);
    }

    /// Waits for the next emitted event.
    pub async fn recv(&mut self) -> Option<OutboundEvent> {
        self.outbound.recv().await
    }

    /// Returns an already emitted event, if any.
    pub fn try_recv(&mut self) -> Option<OutboundEvent> {
        self.outbound.try_recv().ok()
    }

    /// Drains every already emitted event.
    pub fn drain(&mut self) -> Vec<OutboundEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_frame_wire_shape() {
        let event = OutboundEvent::RawFrame(RawFrameMessage {
            uid: 42,
            rid: 7,
            frame: vec![0xFF, 0xD8],
        });
        assert_eq!(event.name(), "raw_frame");
        assert_eq!(
            event.to_json().unwrap(),
            json!({"uid": 42, "rid": 7, "frame": [255, 216]})
        );
    }

    #[test]
    fn test_inbound_from_wire() {
        assert_eq!(
            InboundEvent::from_wire("verified", json!({"message": "ok"})).unwrap(),
            InboundEvent::Verified
        );
        assert_eq!(
            InboundEvent::from_wire("annotated_frame", json!("abcd")).unwrap(),
            InboundEvent::AnnotatedFrame(AnnotatedPayload::Text("abcd".into()))
        );
        assert_eq!(
            InboundEvent::from_wire("annotated_frame", json!([1, 2, 3])).unwrap(),
            InboundEvent::AnnotatedFrame(AnnotatedPayload::Bytes(vec![1, 2, 3]))
        );
        assert_eq!(
            InboundEvent::from_wire("annotated_frame", json!({"frame": "abcd"})).unwrap(),
            InboundEvent::AnnotatedFrame(AnnotatedPayload::Envelope {
                frame: Some("abcd".into())
            })
        );
        assert_eq!(
            InboundEvent::from_wire("app_error", json!({"message": "User not logged in"})).unwrap(),
            InboundEvent::Notice {
                event: "app_error".into(),
                message: "User not logged in".into()
            }
        );
    }

    #[test]
    fn test_inbound_from_wire_rejects_garbage() {
        assert!(matches!(
            InboundEvent::from_wire("annotated_frame", json!([1, 300])),
            Err(ChannelError::MalformedPayload { .. })
        ));
        assert!(matches!(
            InboundEvent::from_wire("bogus", Value::Null),
            Err(ChannelError::UnknownEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_emit_requires_connection() {
        let (channel, mut backend) = LocalChannel::new();
        let report = OutboundEvent::NotVerified(DoseReport { uid: 1, rid: 2 });

        channel.emit(report.clone()).unwrap();
        assert_eq!(backend.recv().await, Some(report.clone()));

        backend.set_connected(false);
        assert!(matches!(channel.emit(report), Err(ChannelError::Disconnected)));
    }

    #[tokio::test]
    async fn test_detach_stops_delivery() {
        let (channel, backend) = LocalChannel::new();
        let mut first = channel.subscribe();
        let second = channel.subscribe();
        assert_eq!(channel.listener_count(), 2);

        assert!(channel.detach(second.id));
        assert!(!channel.detach(second.id));
        assert_eq!(channel.listener_count(), 1);

        assert_eq!(backend.push(InboundEvent::Verified), 1);
        assert_eq!(first.events.recv().await, Some(InboundEvent::Verified));
    }
}
