//! Scheduler events for observability.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

/// Broadcast channel capacity for scheduler events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Noteworthy things that happen inside the scheduler.
///
/// Delivery is best effort: slow subscribers miss events rather than
/// holding up scheduling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// An instance reached `FAILED`.
    InstanceFailed {
        partition: String,
        instance_id: i64,
        failure_count: u32,
        error: String,
    },
    /// A drain cycle aborted because the store was unavailable.
    StoreUnavailable {
        partition: String,
        consecutive_failures: u32,
        error: String,
        retry_in: Duration,
    },
    /// The worker pool refused a submission.
    PoolSaturated {
        partition: String,
        attempt: u32,
        retry_in: Duration,
    },
    /// A partition was added after startup.
    PartitionRegistered { partition: String },
}

impl SchedulerEvent {
    pub fn partition(&self) -> &str {
        match self {
            Self::InstanceFailed { partition, .. }
            | Self::StoreUnavailable { partition, .. }
            | Self::PoolSaturated { partition, .. }
            | Self::PartitionRegistered { partition } => partition,
        }
    }
}

/// Sender half shared by the manager, the scheduling loop and the actors.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
