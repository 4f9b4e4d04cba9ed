//! Glue between a session and the socket channel.

use super::state::SessionTarget;
use crate::channel::{DoseReport, InboundEvent, RawFrameMessage};
use crate::codec::EncodedFrame;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("reminder id {0:?} is not numeric")]
    InvalidReminderId(String),
}

/// Numeric reminder id as the backend expects it.
pub fn coerce_reminder_id(raw: &str) -> Result<u64, BridgeError> {
    raw.trim()
        .parse()
        .map_err(|_| BridgeError::InvalidReminderId(raw.to_string()))
}

/// Builds the `raw_frame` payload for `target`.
pub fn frame_message(
    target: &SessionTarget,
    frame: EncodedFrame,
) -> Result<RawFrameMessage, BridgeError> {
    Ok(RawFrameMessage {
        uid: target.subject_id,
        rid: coerce_reminder_id(&target.reminder_id)?,
        frame: frame.into_bytes(),
    })
}

/// Builds the `not verified` report for `target`.
pub fn dose_report(target: &SessionTarget) -> Result<DoseReport, BridgeError> {
    Ok(DoseReport {
        uid: target.subject_id,
        rid: coerce_reminder_id(&target.reminder_id)?,
    })
}

/// Receives inbound socket events for one session.
pub trait InboundHandler: Send + Sync + 'static {
    fn handle(self: Arc<Self>, event: InboundEvent);
}

/// Orders a batch of simultaneously queued events.
///
/// A `verified` in the batch is handled first and annotated frames queued
/// alongside it are dropped.
pub fn prioritize(batch: Vec<InboundEvent>) -> Vec<InboundEvent> {
    if !batch.contains(&InboundEvent::Verified) {
        return batch;
    }

    let mut ordered = vec![InboundEvent::Verified];
    ordered.extend(batch.into_iter().filter(|event| {
        !matches!(
            event,
            InboundEvent::Verified | InboundEvent::AnnotatedFrame(_)
        )
    }));
    ordered
}

/// Forwards events to `handler` until the listener is detached or `token`
/// is cancelled.
pub async fn run_listener<H: InboundHandler>(
    mut events: mpsc::UnboundedReceiver<InboundEvent>,
    handler: Arc<H>,
    token: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let mut batch = vec![first];
        while let Ok(event) = events.try_recv() {
            batch.push(event);
        }

        for event in prioritize(batch) {
            if token.is_cancelled() {
                return;
            }
            Arc::clone(&handler).handle(event);
        }
    }
    trace!("Socket listener finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AnnotatedPayload;
    use crate::store::Medicine;
    use std::sync::Mutex;

    fn target(reminder_id: &str) -> SessionTarget {
        SessionTarget {
            subject_id: 42,
            medicine: Medicine::new("7", reminder_id, "Amoxicillin"),
            reminder_id: reminder_id.to_string(),
        }
    }

    fn annotated(text: &str) -> InboundEvent {
        InboundEvent::AnnotatedFrame(AnnotatedPayload::Text(text.to_string()))
    }

    #[test]
    fn test_reminder_id_coercion() {
        assert_eq!(coerce_reminder_id("7").unwrap(), 7);
        assert_eq!(coerce_reminder_id(" 12 ").unwrap(), 12);
        assert!(coerce_reminder_id("abc").is_err());
        assert!(coerce_reminder_id("").is_err());
        assert!(coerce_reminder_id("-3").is_err());
    }

    #[test]
    fn test_report_carries_subject_and_reminder() {
        let report = dose_report(&target("7")).unwrap();
        assert_eq!(report, DoseReport { uid: 42, rid: 7 });
        assert!(dose_report(&target("x7")).is_err());
    }

    #[test]
    fn test_prioritize_without_verified_keeps_order() {
        let batch = vec![annotated("a"), InboundEvent::Disconnected, annotated("b")];
        assert_eq!(prioritize(batch.clone()), batch);
    }

    #[test]
    fn test_verified_wins_over_queued_overlays() {
        let batch = vec![
            annotated("a"),
            InboundEvent::Disconnected,
            InboundEvent::Verified,
            annotated("b"),
            InboundEvent::Verified,
        ];
        assert_eq!(
            prioritize(batch),
            vec![InboundEvent::Verified, InboundEvent::Disconnected]
        );
    }

    struct Recorder(Mutex<Vec<InboundEvent>>);

    impl InboundHandler for Recorder {
        fn handle(self: Arc<Self>, event: InboundEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_listener_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));

        tx.send(annotated("a")).unwrap();
        tx.send(InboundEvent::Verified).unwrap();
        drop(tx);

        run_listener(rx, Arc::clone(&recorder), CancellationToken::new()).await;
        assert_eq!(*recorder.0.lock().unwrap(), vec![InboundEvent::Verified]);
    }

    #[tokio::test]
    async fn test_cancelled_listener_handles_nothing() {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let token = CancellationToken::new();

        tx.send(InboundEvent::Verified).unwrap();
        token.cancel();

        run_listener(rx, Arc::clone(&recorder), token).await;
        assert!(recorder.0.lock().unwrap().is_empty());
    }
}
