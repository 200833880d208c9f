//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` between the scheduler, the
//! pool manager, and the reconciler. Publishing never blocks and never
//! fails; with no subscribers the event is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// FleetEvent
// ---------------------------------------------------------------------------

/// Something that happened to a task, pool member, or device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEvent {
    /// Dot-separated event name, e.g. `"task.completed"`.
    pub event_type: String,

    /// Kind of the subject (`"task"`, `"instance"`, `"device"`).
    pub subject_type: Option<String>,

    /// Task id or instance name.
    pub subject_id: Option<String>,

    /// Free-form JSON payload carrying event-specific data.
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl FleetEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            subject_type: None,
            subject_id: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject_type: impl Into<String>, id: impl ToString) -> Self {
        self.subject_type = Some(subject_type.into());
        self.subject_id = Some(id.to_string());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// `*.failed`, `*.repair_failed` and `*.unhealthy` events.
    pub fn is_failure(&self) -> bool {
        let kind = self.event_type.rsplit('.').next().unwrap_or_default();
        matches!(kind, "failed" | "repair_failed" | "unhealthy")
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 512;

/// In-process fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use droidfleet_events::{EventBus, FleetEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(FleetEvent::new("task.completed").with_subject("task", "t-1"));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: FleetEvent) {
        tracing::trace!(event_type = %event.event_type, "Publishing fleet event");
        // A SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(
            FleetEvent::new("device.port_changed")
                .with_subject("device", "droid-1")
                .with_payload(serde_json::json!({"old_port": 5555, "new_port": 5557})),
        );

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.event_type, "device.port_changed");
        assert_eq!(received.subject_type.as_deref(), Some("device"));
        assert_eq!(received.subject_id.as_deref(), Some("droid-1"));
        assert_eq!(received.payload["new_port"], 5557);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(FleetEvent::new("task.failed"));

        assert_eq!(rx1.recv().await.unwrap().event_type, "task.failed");
        assert_eq!(rx2.recv().await.unwrap().event_type, "task.failed");
    }

    #[test]
    fn failure_events_are_classified_by_suffix() {
        assert!(FleetEvent::new("task.failed").is_failure());
        assert!(FleetEvent::new("device.repair_failed").is_failure());
        assert!(FleetEvent::new("instance.unhealthy").is_failure());
        assert!(!FleetEvent::new("task.retrying").is_failure());
        assert!(!FleetEvent::new("device.reconnected").is_failure());
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(FleetEvent::new("orphan.event"));
    }
}
