//! In-process event bus for scan lifecycle notifications.
//!
//! Delivery is queued and asynchronous: [`EventBus::publish`] never blocks
//! and every subscriber receives every event in publish order. A subscriber
//! that falls more than the channel capacity behind observes
//! `RecvError::Lagged`.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{DeviceRecord, JobId, ScanJob};

/// Events emitted by the scan engine.
///
/// Per job, `ScanStarted` precedes any `Progress` or `DeviceFound`, which
/// precede exactly one of `ScanCompleted` or `ScanError`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    ScanStarted {
        job: ScanJob,
    },
    Progress {
        job_id: JobId,
        probed: u64,
        total: u64,
    },
    DeviceFound {
        job_id: JobId,
        device: DeviceRecord,
    },
    /// Terminal event for `Completed` and `Stopped` jobs.
    ScanCompleted {
        job: ScanJob,
    },
    ScanError {
        job_id: JobId,
        message: String,
    },
}

impl ScanEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            ScanEvent::ScanStarted { job } | ScanEvent::ScanCompleted { job } => job.id,
            ScanEvent::Progress { job_id, .. }
            | ScanEvent::DeviceFound { job_id, .. }
            | ScanEvent::ScanError { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanEvent::ScanCompleted { .. } | ScanEvent::ScanError { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScanEvent::ScanStarted { .. } => "scan_started",
            ScanEvent::Progress { .. } => "progress",
            ScanEvent::DeviceFound { .. } => "device_found",
            ScanEvent::ScanCompleted { .. } => "scan_completed",
            ScanEvent::ScanError { .. } => "scan_error",
        }
    }
}

pub const DEFAULT_CAPACITY: usize = 4096;

/// Fan-out bus shared by the job manager and its subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ScanEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped silently when nobody listens.
    pub fn publish(&self, event: ScanEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let job_id = Uuid::new_v4();

        bus.publish(ScanEvent::Progress { job_id, probed: 1, total: 2 });
        bus.publish(ScanEvent::ScanError { job_id, message: "boom".into() });

        for rx in [&mut a, &mut b] {
            let first = rx.recv().await.unwrap();
            assert_eq!(first.name(), "progress");
            let second = rx.recv().await.unwrap();
            assert!(second.is_terminal());
            assert_eq!(second.job_id(), job_id);
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(ScanEvent::ScanError { job_id: Uuid::new_v4(), message: "x".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
