//! Typed progress streaming for in-flight applications.
//!
//! The executor emits typed `StatusEvent`s into a per-application broadcast
//! channel, and each SSE request consumes one receiver. When the consumer
//! disconnects its receiver is dropped; the hub prunes the channel on the
//! next emit, so an application nobody watches costs nothing. A request
//! that subscribes and then bails out before any emit releases its channel
//! explicitly.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::application::ApplicationStatus;

const CHANNEL_CAPACITY: usize = 32;

/// One event on an application's progress stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Connected {
        application_id: Uuid,
    },
    Progress {
        stage: ProgressStage,
        detail: String,
    },
    Error {
        error_type: String,
        message: String,
    },
    Done {
        status: ApplicationStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Dispatched,
    Applying,
    Replay,
    Recording,
    Captcha,
    Confirmation,
    RetryScheduled,
    Escalated,
}

/// Registry of per-application broadcast channels.
#[derive(Default)]
pub struct ProgressHub {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<StatusEvent>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or joins) the channel for an application.
    pub fn subscribe(&self, application_id: Uuid) -> broadcast::Receiver<StatusEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(application_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Removes the channel if nobody is subscribed. Callers that subscribe
    /// and then bail out before any emit happens (unknown id, already
    /// terminal) use this to undo the entry `subscribe` created.
    pub fn release(&self, application_id: Uuid) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = channels.get(&application_id) {
            if tx.receiver_count() == 0 {
                channels.remove(&application_id);
            }
        }
    }

    /// Emits an event to whoever is watching. A channel with no remaining
    /// receivers is pruned; a `Done` event closes the channel after sending.
    pub fn emit(&self, application_id: Uuid, event: StatusEvent) {
        let done = matches!(event, StatusEvent::Done { .. });
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        match channels.get(&application_id) {
            Some(tx) if tx.receiver_count() > 0 => {
                // A send error only means every receiver vanished between the
                // count check and the send; safe to ignore.
                let _ = tx.send(event);
                if done {
                    channels.remove(&application_id);
                }
            }
            Some(_) => {
                channels.remove(&application_id);
            }
            None => {}
        }
    }

    pub fn progress(&self, application_id: Uuid, stage: ProgressStage, detail: impl Into<String>) {
        self.emit(
            application_id,
            StatusEvent::Progress {
                stage,
                detail: detail.into(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let hub = ProgressHub::new();
        let id = Uuid::new_v4();
        let mut rx = hub.subscribe(id);

        hub.progress(id, ProgressStage::Dispatched, "queued");
        hub.progress(id, ProgressStage::Applying, "executing");

        match rx.recv().await.unwrap() {
            StatusEvent::Progress { stage, .. } => assert_eq!(stage, ProgressStage::Dispatched),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            StatusEvent::Progress { stage, .. } => assert_eq!(stage, ProgressStage::Applying),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscriber_is_noop() {
        let hub = ProgressHub::new();
        let id = Uuid::new_v4();
        // No channel exists: nothing to do, nothing to panic about.
        hub.progress(id, ProgressStage::Applying, "ignored");
        assert!(hub.channels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_done_closes_the_channel() {
        let hub = ProgressHub::new();
        let id = Uuid::new_v4();
        let mut rx = hub.subscribe(id);

        hub.emit(
            id,
            StatusEvent::Done {
                status: ApplicationStatus::Submitted,
            },
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            StatusEvent::Done { .. }
        ));
        // Channel pruned: the sender is gone, so the stream ends.
        assert!(hub.channels.lock().unwrap().is_empty());
        assert!(rx.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_prunes_channel_on_next_emit() {
        let hub = ProgressHub::new();
        let id = Uuid::new_v4();
        let rx = hub.subscribe(id);
        drop(rx);

        hub.progress(id, ProgressStage::Applying, "nobody listening");
        assert!(hub.channels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_prunes_abandoned_channel() {
        let hub = ProgressHub::new();
        let id = Uuid::new_v4();
        drop(hub.subscribe(id));

        hub.release(id);
        assert!(hub.channels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_channel_with_live_subscriber() {
        let hub = ProgressHub::new();
        let id = Uuid::new_v4();
        let _rx = hub.subscribe(id);

        hub.release(id);
        assert_eq!(hub.channels.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_subscribes_do_not_accumulate() {
        // Repeated subscribe-then-bail cycles (a stream request for an id
        // that turns out to be unknown or already terminal) must not grow
        // the channel map.
        let hub = ProgressHub::new();
        for _ in 0..100 {
            let id = Uuid::new_v4();
            drop(hub.subscribe(id));
            hub.release(id);
        }
        assert!(hub.channels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let hub = ProgressHub::new();
        let id = Uuid::new_v4();
        let mut rx1 = hub.subscribe(id);
        let mut rx2 = hub.subscribe(id);

        hub.progress(id, ProgressStage::Replay, "replaying recipe");

        assert!(matches!(
            rx1.recv().await.unwrap(),
            StatusEvent::Progress { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            StatusEvent::Progress { .. }
        ));
    }

    #[test]
    fn test_event_wire_format() {
        let event = StatusEvent::Progress {
            stage: ProgressStage::RetryScheduled,
            detail: "attempt 2".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["stage"], "retry_scheduled");
    }
}
