//! socket.io transport to the inference backend.

use super::{
    ChannelError, Hub, InboundEvent, ListenerId, OutboundEvent, SocketChannel, Subscription,
    EVENT_ANNOTATED_FRAME, EVENT_ERROR,
};
use crate::codec::AnnotatedPayload;
use crate::config::BackendConfig;
use futures_util::FutureExt;
use rust_socketio::asynchronous::{Client, ClientBuilder};
use rust_socketio::{Event, Payload};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shared socket.io connection.
///
/// Emits are queued and written in order by one task, so [`SocketChannel::emit`]
/// never waits on the network.
pub struct SocketIoChannel {
    hub: Arc<Hub>,
    client: Client,
    writer: JoinHandle<()>,
}

impl SocketIoChannel {
    /// Connects to the backend's socket.io endpoint.
    pub async fn connect(backend: &BackendConfig) -> Result<Self, ChannelError> {
        let url = backend.socket_url();
        let (hub, outbound) = Hub::new(false);

        let on_open = Arc::clone(&hub);
        let on_close = Arc::clone(&hub);
        let on_error = Arc::clone(&hub);
        let on_event = Arc::clone(&hub);
        let client = ClientBuilder::new(url.as_str())
            .reconnect_on_disconnect(true)
            .on(Event::Connect, move |_, _| {
                let hub = Arc::clone(&on_open);
                async move {
                    if hub.set_connected(true) {
                        info!("Socket connected");
                    }
                }
                .boxed()
            })
            .on(Event::Close, move |_, _| {
                let hub = Arc::clone(&on_close);
                async move {
                    if hub.set_connected(false) {
                        warn!("Socket closed");
                    }
                }
                .boxed()
            })
            .on(Event::Error, move |payload, _| {
                let hub = Arc::clone(&on_error);
                async move {
                    hub.broadcast(InboundEvent::Notice {
                        event: EVENT_ERROR.to_string(),
                        message: payload_text(payload),
                    });
                }
                .boxed()
            })
            .on_any(move |event, payload, _| {
                let hub = Arc::clone(&on_event);
                async move {
                    let name = match event {
                        Event::Custom(name) => name,
                        Event::Message => "message".to_string(),
                        _ => return,
                    };
                    dispatch(&hub, &name, payload);
                }
                .boxed()
            })
            .connect()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        hub.set_connected(true);
        info!(%url, "Socket.io client connected");
        let writer = tokio::spawn(write_outbound(client.clone(), outbound));
        Ok(Self { hub, client, writer })
    }

    /// Closes the connection. Queued emits that were not written are lost.
    pub async fn disconnect(&self) -> Result<(), ChannelError> {
        self.writer.abort();
        self.hub.set_connected(false);
        self.client
            .disconnect()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.hub.listener_count()
    }
}

impl Drop for SocketIoChannel {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

impl SocketChannel for SocketIoChannel {
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

async fn write_outbound(client: Client, mut outbound: mpsc::UnboundedReceiver<OutboundEvent>) {
    while let Some(event) = outbound.recv().await {
        let name = event.name();
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event = name, "Cannot serialize outbound event: {}", e);
                continue;
            }
        };
        if let Err(e) = client.emit(name, payload).await {
            warn!(event = name, "Socket emit failed: {}", e);
        }
    }
}

/// Decodes one socket.io event and hands it to every listener.
fn dispatch(hub: &Hub, name: &str, payload: Payload) -> usize {
    match inbound_from_payload(name, payload) {
        Ok(event) => hub.broadcast(event),
        Err(e) => {
            debug!(event = name, "Dropping inbound event: {}", e);
            0
        }
    }
}

/// Maps a socket.io payload onto the inbound vocabulary.
///
/// Binary attachments are only meaningful for `annotated_frame`; every
/// other event carries its data as the first JSON argument.
fn inbound_from_payload(name: &str, payload: Payload) -> Result<InboundEvent, ChannelError> {
    match payload {
        Payload::Binary(bytes) if name == EVENT_ANNOTATED_FRAME => Ok(
            InboundEvent::AnnotatedFrame(AnnotatedPayload::Bytes(bytes.to_vec())),
        ),
        Payload::Text(values) => {
            InboundEvent::from_wire(name, values.into_iter().next().unwrap_or(Value::Null))
        }
        _ => Err(ChannelError::MalformedPayload {
            event: name.to_string(),
        }),
    }
}

fn payload_text(payload: Payload) -> String {
    match payload {
        Payload::Text(values) => match values.into_iter().next() {
            Some(Value::String(text)) => text,
            Some(other) => other.to_string(),
            None => String::new(),
        },
        Payload::Binary(bytes) => format!("<{} binary bytes>", bytes.len()),
        other => format!("{other:?}"),
    }
}
