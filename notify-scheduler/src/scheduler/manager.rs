//! Actor manager.
//!
//! Owns one [`ConsumingActor`] per partition, the shared worker pool and the
//! scheduling loop. Partitions can be added after startup, either directly
//! or as a new discriminator value of a fan-out base.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::actor::{ActorRunState, ConsumingActor, ConsumingActorConfig, MetricsSnapshot};
use super::events::{EventBroadcaster, SchedulerEvent};
use super::listener::{ConsumerListener, ListenerRegistry};
use super::processor::ProcessorRegistry;
use super::scheduling_loop::{LoopConfig, SchedulerCommand, SchedulingLoop};
use super::store::JobInstanceStore;
use super::worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::config::SchedulerConfig;
use crate::domain::{BackoffPolicy, PartitionKey, validate_disjoint};
use crate::{Error, Result};

/// Summary of [`ActorManager::stop`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Partitions registered at shutdown start.
    pub total_partitions: usize,
    /// Drain cycles that finished within the shutdown timeout.
    pub completed_cycles: usize,
    /// Drain cycles aborted when the timeout ran out.
    pub forced_terminations: usize,
}

impl ShutdownReport {
    /// No drain cycle had to be aborted.
    pub fn all_graceful(&self) -> bool {
        self.forced_terminations == 0
    }
}

#[derive(Clone)]
struct ActorEntry {
    actor: Arc<ConsumingActor>,
    listener: ConsumerListener,
}

pub struct ActorManager {
    config: SchedulerConfig,
    store: Arc<dyn JobInstanceStore>,
    processors: ProcessorRegistry,
    backoff: Arc<dyn BackoffPolicy>,
    pool: Arc<WorkerPool>,
    events: EventBroadcaster,
    commands: mpsc::UnboundedSender<SchedulerCommand>,
    actors: DashMap<String, ActorEntry>,
    /// Every registered key; held while checking a new key for overlap.
    keys: Mutex<Vec<Arc<PartitionKey>>>,
    /// Fan-out bases by name.
    bases: HashMap<String, PartitionKey>,
    /// Registries attached via `register_listener`, replayed for late partitions.
    attached: Mutex<Vec<(String, ListenerRegistry)>>,
    next_slot: AtomicUsize,
    cancellation_token: CancellationToken,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ActorManager {
    /// Validate the partition set, spawn the scheduling loop and one actor
    /// per configured partition.
    pub async fn start(
        config: SchedulerConfig,
        store: Arc<dyn JobInstanceStore>,
        processors: ProcessorRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let mut keys = Vec::new();
        let mut bases = HashMap::new();
        for partition in &config.partitions {
            if partition.fan_out.is_some()
                && bases
                    .insert(partition.key.name().to_string(), partition.key.clone())
                    .is_some()
            {
                return Err(Error::config(format!(
                    "fan-out partition '{}' declared twice",
                    partition.key.name()
                )));
            }
            keys.extend(partition.expand()?);
        }
        validate_disjoint(keys.iter())?;
        for key in &keys {
            processors.resolve(key.instance_type())?;
        }

        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig {
            pool_size: config.pool_size,
            queue_capacity: config.queue_capacity,
            max_in_flight: config.max_in_flight,
        }));
        let events = EventBroadcaster::new();
        let cancellation_token = CancellationToken::new();
        let (commands, commands_rx) = mpsc::unbounded_channel();

        if let Some(timeout) = config.stale_claim_timeout {
            recover_stale_claims(store.as_ref(), &keys, timeout).await;
        }

        let scheduling_loop = SchedulingLoop::new(
            commands_rx,
            commands.clone(),
            pool.clone(),
            events.clone(),
            LoopConfig::from(&config),
            cancellation_token.child_token(),
        );
        let loop_task = tokio::spawn(scheduling_loop.run());

        let manager = Self {
            backoff: Arc::new(config.retry.clone()),
            config,
            store,
            processors,
            pool,
            events,
            commands,
            actors: DashMap::new(),
            keys: Mutex::new(Vec::new()),
            bases,
            attached: Mutex::new(Vec::new()),
            next_slot: AtomicUsize::new(0),
            cancellation_token,
            loop_task: Mutex::new(Some(loop_task)),
            stopped: AtomicBool::new(false),
        };

        let count = keys.len();
        for key in keys {
            manager.keys.lock().push(Arc::new(key.clone()));
            // Dropping the manager cancels the loop on error.
            manager.spawn_actor(key).await?;
        }

        info!(
            "ActorManager started with {} partitions ({} workers, {} in flight)",
            count, manager.config.pool_size, manager.config.max_in_flight
        );
        Ok(manager)
    }

    /// Add a partition after startup.
    pub async fn register_partition(&self, key: PartitionKey) -> Result<ConsumerListener> {
        if self.is_stopped() {
            return Err(Error::Scheduler("actor manager is stopped".to_string()));
        }
        self.processors.resolve(key.instance_type())?;
        {
            let mut keys = self.keys.lock();
            for existing in keys.iter() {
                if existing.name() == key.name() {
                    return Err(Error::config(format!(
                        "partition '{}' is already registered",
                        key.name()
                    )));
                }
                if !existing.is_disjoint_from(&key) {
                    return Err(Error::config(format!(
                        "partition '{}' overlaps partition '{}'",
                        key.name(),
                        existing.name()
                    )));
                }
            }
            keys.push(Arc::new(key.clone()));
        }

        let name = key.name().to_string();
        let listener = self.spawn_actor(key).await?;
        self.events
            .publish(SchedulerEvent::PartitionRegistered { partition: name });
        Ok(listener)
    }

    /// Add the partition for a new `value` of the fan-out base `base`.
    pub async fn register_discriminator(
        &self,
        base: &str,
        value: &str,
    ) -> Result<ConsumerListener> {
        let key = self
            .bases
            .get(base)
            .ok_or_else(|| Error::not_found("fan-out partition", base))?
            .derive(value)?;
        self.register_partition(key).await
    }

    async fn spawn_actor(&self, key: PartitionKey) -> Result<ConsumerListener> {
        let processor = self.processors.resolve(key.instance_type())?;
        let key = Arc::new(key);
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);

        let actor = Arc::new(ConsumingActor::new(
            key.clone(),
            self.store.clone(),
            processor,
            self.backoff.clone(),
            self.pool.clone(),
            ConsumingActorConfig {
                batch_size: self.config.batch_size,
                processor_timeout: self.config.processor_timeout,
                suspend_backoff_base: self.config.suspend_backoff_base,
                suspend_backoff_max: self.config.suspend_backoff_max,
            },
            self.cancellation_token.child_token(),
            self.events.clone(),
        ));
        let pending = Arc::new(AtomicBool::new(false));
        let listener = ConsumerListener::new(slot, key.clone(), pending.clone(), self.commands.clone());

        let initial_due = match self.store.next_due_time(&key).await {
            Ok(due) => due,
            Err(e) => {
                warn!(
                    partition = %key.name(),
                    "Could not read next due time, checking immediately: {}", e
                );
                Some(Utc::now())
            }
        };

        // Register before handing out the listener so no wake can overtake it.
        self.commands
            .send(SchedulerCommand::Register {
                slot,
                actor: actor.clone(),
                pending,
                initial_due,
            })
            .map_err(|_| Error::Scheduler("scheduling loop has stopped".to_string()))?;

        self.actors.insert(
            key.name().to_string(),
            ActorEntry {
                actor,
                listener: listener.clone(),
            },
        );
        self.attach_to_registries(&key, &listener);

        info!(partition = %key.name(), next_due = ?initial_due, "ConsumingActor {} registered", key.name());
        Ok(listener)
    }

    /// The wake handle of a partition.
    pub fn listener(&self, partition: &str) -> Option<ConsumerListener> {
        self.actors.get(partition).map(|e| e.listener.clone())
    }

    /// Attach every partition selected by `discriminator` to `registry`.
    ///
    /// A partition is selected when its name or its discriminator value
    /// equals `discriminator`. Partitions registered later are attached as
    /// they appear. Returns how many partitions were attached now.
    pub fn register_listener(&self, discriminator: &str, registry: &ListenerRegistry) -> usize {
        self.attached
            .lock()
            .push((discriminator.to_string(), registry.clone()));

        let mut attached = 0;
        for entry in self.actors.iter() {
            if selects(entry.actor.key(), discriminator) {
                registry.register(discriminator, entry.listener.clone());
                attached += 1;
            }
        }
        debug!(discriminator, attached, "Listener registry attached");
        attached
    }

    fn attach_to_registries(&self, key: &PartitionKey, listener: &ConsumerListener) {
        for (discriminator, registry) in self.attached.lock().iter() {
            if selects(key, discriminator) {
                registry.register(discriminator.clone(), listener.clone());
            }
        }
    }

    /// Ready instances currently waiting in a partition.
    pub async fn pending_count(&self, partition: &str) -> Result<u64> {
        let key = self
            .actors
            .get(partition)
            .map(|e| e.actor.key().clone())
            .ok_or_else(|| Error::not_found("partition", partition))?;
        self.store.count_ready(&key, Utc::now()).await
    }

    pub fn actor_state(&self, partition: &str) -> Option<ActorRunState> {
        self.actors.get(partition).map(|e| e.actor.run_state())
    }

    pub fn metrics(&self, partition: &str) -> Option<MetricsSnapshot> {
        self.actors.get(partition).map(|e| e.actor.metrics().snapshot())
    }

    /// Registered partition names, sorted.
    pub fn partitions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop every actor, let in-flight cycles finish within
    /// `shutdown_timeout`, and shut down the pool. Later calls are no-ops.
    pub async fn stop(&self) -> ShutdownReport {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("ActorManager already stopped");
            return ShutdownReport::default();
        }

        let total_partitions = self.actors.len();
        info!("Stopping ActorManager with {} partitions", total_partitions);

        for entry in self.actors.iter() {
            entry.actor.stop();
        }
        self.cancellation_token.cancel();

        let loop_task = self.loop_task.lock().take();
        if let Some(task) = loop_task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Scheduling loop panicked: {}", e);
                }
            }
        }

        let pool = self.pool.shutdown(self.config.shutdown_timeout).await;
        let report = ShutdownReport {
            total_partitions,
            completed_cycles: pool.completed,
            forced_terminations: pool.aborted,
        };

        if report.all_graceful() {
            info!("ActorManager stopped: {:?}", report);
        } else {
            warn!(
                "ActorManager stopped with {} drain cycles aborted",
                report.forced_terminations
            );
        }
        report
    }
}

impl Drop for ActorManager {
    fn drop(&mut self) {
        // Without an explicit stop the loop would outlive the manager.
        self.cancellation_token.cancel();
    }
}

impl std::fmt::Debug for ActorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorManager")
            .field("partitions", &self.partitions())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn selects(key: &PartitionKey, discriminator: &str) -> bool {
    key.name() == discriminator || key.discriminator() == Some(discriminator)
}

/// Return `RUNNING` instances abandoned by a previous process to `DEFERRED`.
async fn recover_stale_claims(
    store: &dyn JobInstanceStore,
    keys: &[PartitionKey],
    timeout: std::time::Duration,
) {
    let cutoff = TimeDelta::from_std(timeout)
        .ok()
        .and_then(|timeout| Utc::now().checked_sub_signed(timeout))
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
    for key in keys {
        match store.reset_stale_running(key, cutoff).await {
            Ok(0) => {}
            Ok(n) => info!(partition = %key.name(), "Recovered {} stale claims", n),
            Err(e) => warn!(partition = %key.name(), "Stale claim recovery failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionConfig;
    use crate::domain::{JobInstance, NewJobInstance};
    use crate::scheduler::memory_store::InMemoryJobInstanceStore;
    use crate::scheduler::processor::{JobInstanceProcessor, ProcessOutcome};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl JobInstanceProcessor for Noop {
        async fn process(&self, _instance: &JobInstance) -> ProcessOutcome {
            ProcessOutcome::done()
        }
    }

    fn processors() -> ProcessorRegistry {
        ProcessorRegistry::new().with("job_instance", Arc::new(Noop))
    }

    fn channel_base() -> PartitionKey {
        PartitionKey::builder("notifications").build().unwrap()
    }

    #[tokio::test]
    async fn test_rejects_overlapping_partitions() {
        let config = SchedulerConfig::default()
            .with_partition(PartitionConfig::new(channel_base()))
            .with_partition(PartitionConfig::new(
                PartitionKey::builder("email").filter("channel_type", "email").build().unwrap(),
            ));
        let err = ActorManager::start(config, Arc::new(InMemoryJobInstanceStore::new()), processors())
            .await
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_missing_processor_fails_start() {
        let config = SchedulerConfig::default().with_partition(PartitionConfig::new(
            PartitionKey::builder("reminders").instance_type("reminder").build().unwrap(),
        ));
        let err = ActorManager::start(config, Arc::new(InMemoryJobInstanceStore::new()), processors())
            .await
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_fan_out_and_late_discriminator() {
        let config = SchedulerConfig::default()
            .with_partition(PartitionConfig::fan_out(channel_base(), ["email", "sms"]));
        let manager = ActorManager::start(config, Arc::new(InMemoryJobInstanceStore::new()), processors())
            .await
            .unwrap();
        assert_eq!(manager.partitions(), vec!["notifications/email", "notifications/sms"]);

        let registry = ListenerRegistry::new();
        assert_eq!(manager.register_listener("push", &registry), 0);

        let mut events = manager.subscribe();
        let listener = manager.register_discriminator("notifications", "push").await.unwrap();
        assert_eq!(listener.partition(), "notifications/push");
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            SchedulerEvent::PartitionRegistered { partition } if partition == "notifications/push"
        ));

        let err = manager.register_discriminator("notifications", "email").await.err().unwrap();
        assert!(err.is_configuration());
        assert!(manager.register_discriminator("unknown", "x").await.is_err());

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let store = Arc::new(InMemoryJobInstanceStore::new());
        store.insert(NewJobInstance::new("job", Utc::now())).await.unwrap();
        let config = SchedulerConfig::default().with_partition(PartitionConfig::new(channel_base()));
        let manager = ActorManager::start(config, store.clone(), processors()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let report = manager.stop().await;
        assert_eq!(report.total_partitions, 1);
        assert!(report.all_graceful());
        assert_eq!(manager.actor_state("notifications"), Some(ActorRunState::Stopped));

        assert_eq!(manager.stop().await, ShutdownReport::default());
        assert!(manager.register_partition(channel_base()).await.is_err());
        assert_eq!(store.count_in_state(crate::domain::JobInstanceState::Running), 0);
    }
}
