//! Fleet event logging.
//!
//! Subscribes to the bus and writes every event to the tracing output, so
//! the daemon log carries the full task/instance/device history.

use droidfleet_events::FleetEvent;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Log events from `rx` until `cancel` fires or the bus is dropped.
/// Returns how many events were logged.
pub async fn run(mut rx: broadcast::Receiver<FleetEvent>, cancel: CancellationToken) -> u64 {
    let mut logged = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => {
                    log_event(&event);
                    logged += 1;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!(logged, "Event logger stopped");
    logged
}

fn log_event(event: &FleetEvent) {
    let subject = match (&event.subject_type, &event.subject_id) {
        (Some(kind), Some(id)) => format!("{kind}:{id}"),
        _ => "-".to_string(),
    };
    if event.is_failure() {
        tracing::warn!(
            event_type = %event.event_type,
            subject = %subject,
            payload = %event.payload,
            "Fleet event",
        );
    } else {
        tracing::info!(
            event_type = %event.event_type,
            subject = %subject,
            payload = %event.payload,
            "Fleet event",
        );
    }
}
