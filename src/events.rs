//! Observer bus for queue change notifications.
//!
//! Events carry only their name; subscribers are expected to pull the
//! current state through [`QueueManager`](crate::manager::QueueManager)
//! queries after a notification arrives.

use tokio::sync::broadcast;

/// Published whenever the set or order of queued jobs changes.
pub const QUEUE_UPDATED: &str = "queue_updated";

/// Published whenever a single job record changes.
pub const QUEUE_ITEM_UPDATED: &str = "queue_item_updated";

/// Completion event name routed by the job's item type.
pub fn item_type_done(item_type: &str) -> String {
    format!("{item_type}_job_done")
}

/// Completion event name for listeners watching a single job.
pub fn job_done(job_id: &str) -> String {
    format!("{job_id}_job_done")
}

/// Fan-out bus for event names.
///
/// Publishing never blocks and never fails; with no subscribers the event
/// is simply dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<String>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Notify all subscribers of an event by name.
    pub fn notify(&self, event: impl Into<String>) {
        let event = event.into();
        tracing::trace!(event = %event, "event published");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
