//! Early-wake signalling for partitions.
//!
//! A [`ConsumerListener`] is handed out by the
//! [`ActorManager`](super::ActorManager) for every partition. Producers call
//! [`ConsumerListener::on_new_instance_available`] after inserting work; the
//! call never blocks and repeated calls collapse into one pending wake until
//! the scheduling loop has picked it up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use super::scheduling_loop::SchedulerCommand;
use crate::domain::{JobInstance, PartitionKey};

/// Wake handle for one partition.
#[derive(Clone)]
pub struct ConsumerListener {
    slot: usize,
    key: Arc<PartitionKey>,
    pending: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<SchedulerCommand>,
}

impl ConsumerListener {
    pub(crate) fn new(
        slot: usize,
        key: Arc<PartitionKey>,
        pending: Arc<AtomicBool>,
        commands: mpsc::UnboundedSender<SchedulerCommand>,
    ) -> Self {
        Self {
            slot,
            key,
            pending,
            commands,
        }
    }

    pub fn partition(&self) -> &str {
        self.key.name()
    }

    pub fn partition_key(&self) -> &PartitionKey {
        &self.key
    }

    /// Signal that the partition may have new ready work.
    ///
    /// Returns `true` if this call enqueued a wake, `false` if one was already
    /// pending or the scheduler has shut down.
    pub fn on_new_instance_available(&self) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            trace!(partition = %self.key.name(), "wake already pending, coalesced");
            return false;
        }
        if self
            .commands
            .send(SchedulerCommand::Wake { slot: self.slot })
            .is_err()
        {
            self.pending.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Whether a wake has been sent but not yet handled.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ConsumerListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerListener")
            .field("partition", &self.key.name())
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Producer-side table of listeners keyed by discriminator.
///
/// Cloning shares the same table.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<DashMap<String, Vec<ConsumerListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, discriminator: impl Into<String>, listener: ConsumerListener) {
        let mut entry = self.listeners.entry(discriminator.into()).or_default();
        if !entry.iter().any(|l| l.slot == listener.slot) {
            entry.push(listener);
        }
    }

    /// Signal every listener registered under `discriminator`.
    /// Returns how many wakes were enqueued.
    pub fn notify(&self, discriminator: &str) -> usize {
        self.listeners
            .get(discriminator)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|l| l.on_new_instance_available())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Signal the listeners whose partition selects `instance`.
    pub fn notify_instance(&self, instance: &JobInstance) -> usize {
        let mut woken = 0;
        for entry in self.listeners.iter() {
            for listener in entry.value() {
                if listener.partition_key().matches(instance) && listener.on_new_instance_available() {
                    woken += 1;
                }
            }
        }
        woken
    }

    pub fn len(&self) -> usize {
        self.listeners.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
