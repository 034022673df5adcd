//! Consuming actor: drains one partition.
//!
//! The actor itself has no task of its own. The scheduling loop submits
//! [`ConsumingActor::drain_cycle`] to the worker pool whenever the partition
//! is due, and never submits the same actor twice concurrently. A cycle
//! fetches ready batches in due order, claims each instance, runs the
//! processor, commits the outcome, and finally reports the partition's next
//! due time so the loop can re-arm its timer.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::metrics::ActorMetrics;
use crate::Error;
use crate::domain::{
    BackoffPolicy, JobInstance, JobInstanceState, PartitionKey, Transition, add_delay,
    capped_exponential,
};
use crate::scheduler::events::{EventBroadcaster, SchedulerEvent};
use crate::scheduler::processor::{JobInstanceProcessor, ProcessOutcome};
use crate::scheduler::store::JobInstanceStore;
use crate::scheduler::worker_pool::WorkerPool;

/// Run state of a partition's actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorRunState {
    /// Waiting for the next due time or a listener signal.
    Idle,
    /// Claiming and processing instances.
    Draining,
    /// Waiting for processor admission under backpressure.
    Suspended,
    /// Shut down; refuses further cycles.
    Stopped,
}

impl ActorRunState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Draining => 1,
            Self::Suspended => 2,
            Self::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Draining,
            2 => Self::Suspended,
            _ => Self::Stopped,
        }
    }
}

/// Tuning for a consuming actor.
#[derive(Debug, Clone)]
pub struct ConsumingActorConfig {
    pub batch_size: usize,
    pub processor_timeout: Duration,
    pub suspend_backoff_base: Duration,
    pub suspend_backoff_max: Duration,
}

impl Default for ConsumingActorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            processor_timeout: Duration::from_secs(60),
            suspend_backoff_base: Duration::from_millis(25),
            suspend_backoff_max: Duration::from_secs(1),
        }
    }
}

/// Summary of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub claimed: usize,
    pub lost_claims: usize,
    pub done: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Earliest due time still pending in the partition.
    pub next_due: Option<DateTime<Utc>>,
    /// The cycle ended because the actor was stopped.
    pub stopped: bool,
}

/// Why a drain cycle was cut short.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CycleError {
    #[error("store unavailable for partition {partition}: {message}")]
    StoreUnavailable { partition: String, message: String },

    #[error("drain cycle for partition {partition} panicked: {message}")]
    Panicked { partition: String, message: String },
}

impl CycleError {
    fn store(partition: &str, err: Error) -> Self {
        Self::StoreUnavailable {
            partition: partition.to_string(),
            message: err.to_string(),
        }
    }
}

pub type CycleResult = Result<CycleReport, CycleError>;

pub struct ConsumingActor {
    key: Arc<PartitionKey>,
    store: Arc<dyn JobInstanceStore>,
    processor: Arc<dyn JobInstanceProcessor>,
    backoff: Arc<dyn BackoffPolicy>,
    pool: Arc<WorkerPool>,
    config: ConsumingActorConfig,
    state: AtomicU8,
    cancellation_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    events: EventBroadcaster,
}

impl ConsumingActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: Arc<PartitionKey>,
        store: Arc<dyn JobInstanceStore>,
        processor: Arc<dyn JobInstanceProcessor>,
        backoff: Arc<dyn BackoffPolicy>,
        pool: Arc<WorkerPool>,
        config: ConsumingActorConfig,
        cancellation_token: CancellationToken,
        events: EventBroadcaster,
    ) -> Self {
        let metrics = Arc::new(ActorMetrics::new(key.name()));
        Self {
            key,
            store,
            processor,
            backoff,
            pool,
            config,
            state: AtomicU8::new(ActorRunState::Idle.as_u8()),
            cancellation_token,
            metrics,
            events,
        }
    }

    pub fn name(&self) -> &str {
        self.key.name()
    }

    pub fn key(&self) -> &Arc<PartitionKey> {
        &self.key
    }

    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    pub fn run_state(&self) -> ActorRunState {
        ActorRunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.run_state() == ActorRunState::Stopped
    }

    /// Transition to `STOPPED`. A cycle in progress finishes its current
    /// processor call and exits at the next item boundary.
    pub fn stop(&self) {
        let previous = self.state.swap(ActorRunState::Stopped.as_u8(), Ordering::AcqRel);
        self.cancellation_token.cancel();
        if previous != ActorRunState::Stopped.as_u8() {
            debug!(partition = %self.name(), "ConsumingActor stopped");
        }
    }

    /// Back to `IDLE` after a cycle was cut short by a panic.
    pub(crate) fn mark_idle(&self) {
        self.set_state(ActorRunState::Idle);
    }

    /// `STOPPED` is terminal; nothing moves the actor out of it.
    fn set_state(&self, next: ActorRunState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ActorRunState::Stopped.as_u8()).then_some(next.as_u8())
            });
    }

    fn stop_requested(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Drain the partition until a fetch returns fewer than `batch_size`
    /// instances, then report the next due time.
    pub async fn drain_cycle(&self) -> CycleResult {
        if self.stop_requested() {
            self.set_state(ActorRunState::Stopped);
            return Ok(CycleReport {
                stopped: true,
                ..Default::default()
            });
        }

        self.set_state(ActorRunState::Draining);
        let started = Instant::now();
        let mut report = CycleReport::default();

        let drained = self.drain(&mut report).await;
        self.metrics.record_cycle(started.elapsed());

        if let Err(e) = drained {
            self.metrics.record_store_error();
            self.set_state(ActorRunState::Idle);
            return Err(CycleError::store(self.name(), e));
        }

        if self.stop_requested() {
            self.set_state(ActorRunState::Stopped);
            report.stopped = true;
            return Ok(report);
        }

        match self.store.next_due_time(&self.key).await {
            Ok(next_due) => report.next_due = next_due,
            Err(e) => {
                self.metrics.record_store_error();
                self.set_state(ActorRunState::Idle);
                return Err(CycleError::store(self.name(), e));
            }
        }

        self.set_state(ActorRunState::Idle);
        if report.claimed > 0 {
            debug!(
                partition = %self.name(),
                claimed = report.claimed,
                done = report.done,
                deferred = report.deferred,
                failed = report.failed,
                "Drain cycle finished"
            );
        }
        Ok(report)
    }

    async fn drain(&self, report: &mut CycleReport) -> crate::Result<()> {
        let limit = self.config.batch_size.max(1);
        loop {
            if self.stop_requested() {
                return Ok(());
            }

            let batch = self
                .store
                .fetch_ready_batch(&self.key, Utc::now(), limit)
                .await?;
            let fetched = batch.len();
            report.fetched += fetched;

            let mut queue: VecDeque<JobInstance> = batch.into();
            while let Some(instance) = queue.pop_front() {
                if self.stop_requested() {
                    return Ok(());
                }
                // Admission comes before the claim so a suspended actor keeps
                // its place without holding a RUNNING instance.
                let Some(permit) = self.admit().await else {
                    return Ok(());
                };
                self.run_one(instance, report).await?;
                drop(permit);
            }

            if fetched < limit {
                return Ok(());
            }
        }
    }

    /// Wait for a processor admission permit, suspending while the pool is
    /// saturated. Returns `None` if the actor is stopped meanwhile.
    async fn admit(&self) -> Option<OwnedSemaphorePermit> {
        let mut attempt = 0u32;
        loop {
            if let Some(permit) = self.pool.try_admit() {
                if attempt > 0 {
                    self.set_state(ActorRunState::Draining);
                    trace!(partition = %self.name(), attempt, "Resumed after suspension");
                }
                return Some(permit);
            }

            if attempt == 0 {
                self.set_state(ActorRunState::Suspended);
                self.metrics.record_suspension();
                debug!(partition = %self.name(), "Processor admission saturated, suspending");
            }
            let delay = capped_exponential(
                self.config.suspend_backoff_base,
                self.config.suspend_backoff_max,
                attempt,
            );
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = self.cancellation_token.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_one(&self, mut instance: JobInstance, report: &mut CycleReport) -> crate::Result<()> {
        let id = instance.id;
        if !self.store.try_claim(&self.key, id, instance.state).await? {
            trace!(partition = %self.name(), instance_id = id, "Claim lost, skipping");
            report.lost_claims += 1;
            self.metrics.record_lost_claim();
            return Ok(());
        }
        report.claimed += 1;
        self.metrics.record_claimed();
        instance.state = JobInstanceState::Running;

        let invocation = AssertUnwindSafe(self.processor.process(&instance)).catch_unwind();
        let outcome = match tokio::time::timeout(self.config.processor_timeout, invocation).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(partition = %self.name(), instance_id = id, "Processor panicked: {}", message);
                ProcessOutcome::failed(format!("processor panicked: {}", message))
            }
            Err(_) => ProcessOutcome::retry(format!(
                "processor timed out after {:?}",
                self.config.processor_timeout
            )),
        };

        let transition = self.transition_for(&instance, outcome);
        let target = transition.state;
        match self.store.commit(&self.key, id, transition).await {
            Ok(()) => {}
            Err(e @ Error::InvalidStateTransition { .. }) => {
                // Someone else moved the instance; nothing to undo here.
                warn!(partition = %self.name(), instance_id = id, "Commit rejected: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        match target {
            JobInstanceState::Done => {
                report.done += 1;
                self.metrics.record_done();
            }
            JobInstanceState::Deferred => {
                report.deferred += 1;
                self.metrics.record_deferred();
            }
            JobInstanceState::Failed => {
                report.failed += 1;
                self.metrics.record_failed();
            }
            _ => {}
        }
        Ok(())
    }

    fn transition_for(&self, instance: &JobInstance, outcome: ProcessOutcome) -> Transition {
        let failures = instance.failure_count.saturating_add(1);
        match outcome {
            ProcessOutcome::Done(result) => Transition::done(result),
            ProcessOutcome::Failed(reason) => {
                self.report_failure(instance, failures, &reason);
                Transition::failed(failures, reason)
            }
            ProcessOutcome::Retry { reason, not_before } => {
                if failures > self.backoff.max_retries() {
                    self.report_failure(instance, failures, &reason);
                    return Transition::failed(failures, reason);
                }
                let due_at = not_before.unwrap_or_else(|| {
                    add_delay(Utc::now(), self.backoff.delay_for_attempt(failures - 1))
                });
                debug!(
                    partition = %self.name(),
                    instance_id = instance.id,
                    failures,
                    %due_at,
                    "Deferring after retryable failure: {}",
                    reason
                );
                Transition::deferred(due_at, failures, reason)
            }
        }
    }

    fn report_failure(&self, instance: &JobInstance, failures: u32, reason: &str) {
        warn!(
            partition = %self.name(),
            instance_id = instance.id,
            failures,
            "Instance failed: {}",
            reason
        );
        self.events.publish(SchedulerEvent::InstanceFailed {
            partition: self.name().to_string(),
            instance_id: instance.id,
            failure_count: failures,
            error: reason.to_string(),
        });
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl std::fmt::Debug for ConsumingActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumingActor")
            .field("partition", &self.key.name())
            .field("state", &self.run_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewJobInstance, RetryPolicy};
    use crate::scheduler::memory_store::InMemoryJobInstanceStore;
    use crate::scheduler::worker_pool::WorkerPoolConfig;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use parking_lot::Mutex;

    /// Records invocation order and answers with a fixed outcome.
    struct Recording {
        seen: Mutex<Vec<String>>,
        outcome: ProcessOutcome,
    }

    impl Recording {
        fn new(outcome: ProcessOutcome) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                outcome,
            })
        }
    }

    #[async_trait]
    impl JobInstanceProcessor for Recording {
        async fn process(&self, instance: &JobInstance) -> ProcessOutcome {
            assert_eq!(instance.state, JobInstanceState::Running);
            self.seen.lock().push(instance.job_ref.clone());
            self.outcome.clone()
        }
    }

    fn actor(
        store: Arc<InMemoryJobInstanceStore>,
        processor: Arc<dyn JobInstanceProcessor>,
        batch_size: usize,
    ) -> ConsumingActor {
        let key = Arc::new(PartitionKey::builder("notifications").build().unwrap());
        ConsumingActor::new(
            key,
            store,
            processor,
            Arc::new(RetryPolicy {
                use_jitter: false,
                ..RetryPolicy::with_max_retries(2)
            }),
            Arc::new(WorkerPool::new(WorkerPoolConfig::default())),
            ConsumingActorConfig {
                batch_size,
                ..Default::default()
            },
            CancellationToken::new(),
            EventBroadcaster::new(),
        )
    }

    #[tokio::test]
    async fn test_drains_in_due_order_across_batches() {
        let store = Arc::new(InMemoryJobInstanceStore::new());
        let now = Utc::now();
        for (job, offset) in [("c", -1), ("a", -3), ("d", 60), ("b", -2)] {
            store
                .insert(NewJobInstance::new(job, now + TimeDelta::seconds(offset)))
                .await
                .unwrap();
        }
        let processor = Recording::new(ProcessOutcome::done());
        let actor = actor(store.clone(), processor.clone(), 2);

        let report = actor.drain_cycle().await.unwrap();

        assert_eq!(*processor.seen.lock(), vec!["a", "b", "c"]);
        assert_eq!(report.done, 3);
        assert_eq!(report.next_due, Some(now + TimeDelta::seconds(60)));
        assert_eq!(actor.run_state(), ActorRunState::Idle);
        assert_eq!(store.count_in_state(JobInstanceState::Done), 3);
    }

    #[tokio::test]
    async fn test_retry_defers_then_fails() {
        let store = Arc::new(InMemoryJobInstanceStore::new());
        let id = store
            .insert(NewJobInstance::new("flaky", Utc::now()))
            .await
            .unwrap();
        let actor = actor(store.clone(), Recording::new(ProcessOutcome::retry("smtp 421")), 10);

        let report = actor.drain_cycle().await.unwrap();
        assert_eq!(report.deferred, 1);
        let stored = store.get("job_instance", id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobInstanceState::Deferred);
        assert_eq!(stored.failure_count, 1);
        assert!(stored.due_at > Utc::now() + TimeDelta::milliseconds(500));

        // Exhaust the remaining budget by pulling the due time back.
        for expected_failures in [2, 3] {
            let mut instance = store.get("job_instance", id).await.unwrap().unwrap();
            instance.due_at = Utc::now() - TimeDelta::seconds(1);
            store.put(instance);
            actor.drain_cycle().await.unwrap();
            let stored = store.get("job_instance", id).await.unwrap().unwrap();
            assert_eq!(stored.failure_count, expected_failures);
        }
        let stored = store.get("job_instance", id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobInstanceState::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("smtp 421"));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let store = Arc::new(InMemoryJobInstanceStore::new());
        let id = store.insert(NewJobInstance::new("bad", Utc::now())).await.unwrap();
        let actor = actor(store.clone(), Recording::new(ProcessOutcome::failed("bad address")), 10);
        let mut events = actor.events.subscribe();

        let report = actor.drain_cycle().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.next_due, None);
        let stored = store.get("job_instance", id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobInstanceState::Failed);
        assert_eq!(stored.failure_count, 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            SchedulerEvent::InstanceFailed { instance_id, .. } if instance_id == id
        ));
    }

    #[tokio::test]
    async fn test_processor_not_before_overrides_backoff() {
        let store = Arc::new(InMemoryJobInstanceStore::new());
        let id = store.insert(NewJobInstance::new("later", Utc::now())).await.unwrap();
        let at = Utc::now() + TimeDelta::hours(1);
        let actor = actor(store.clone(), Recording::new(ProcessOutcome::retry_at("quiet hours", at)), 10);

        let report = actor.drain_cycle().await.unwrap();

        assert_eq!(report.next_due, Some(at));
        assert_eq!(store.get("job_instance", id).await.unwrap().unwrap().due_at, at);
    }

    /// Panics on `boom`, succeeds otherwise.
    struct Panicky;

    #[async_trait]
    impl JobInstanceProcessor for Panicky {
        async fn process(&self, instance: &JobInstance) -> ProcessOutcome {
            if instance.job_ref == "boom" {
                panic!("template missing for {}", instance.job_ref);
            }
            ProcessOutcome::done()
        }
    }

    /// Never answers within the test's processor timeout.
    struct Sleepy;

    #[async_trait]
    impl JobInstanceProcessor for Sleepy {
        async fn process(&self, _instance: &JobInstance) -> ProcessOutcome {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ProcessOutcome::done()
        }
    }

    #[tokio::test]
    async fn test_processor_panic_fails_only_that_instance() {
        let store = Arc::new(InMemoryJobInstanceStore::new());
        let now = Utc::now();
        let boom = store
            .insert(NewJobInstance::new("boom", now - TimeDelta::seconds(2)))
            .await
            .unwrap();
        let fine = store
            .insert(NewJobInstance::new("fine", now - TimeDelta::seconds(1)))
            .await
            .unwrap();
        let actor = actor(store.clone(), Arc::new(Panicky), 10);
        let mut events = actor.events.subscribe();

        let report = actor.drain_cycle().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.done, 1);
        assert_eq!(actor.run_state(), ActorRunState::Idle);
        assert_eq!(store.count_in_state(JobInstanceState::Running), 0);

        let failed = store.get("job_instance", boom).await.unwrap().unwrap();
        assert_eq!(failed.state, JobInstanceState::Failed);
        assert!(failed.last_error.unwrap().contains("template missing for boom"));
        let done = store.get("job_instance", fine).await.unwrap().unwrap();
        assert_eq!(done.state, JobInstanceState::Done);
        assert!(matches!(
            events.try_recv().unwrap(),
            SchedulerEvent::InstanceFailed { instance_id, .. } if instance_id == boom
        ));
    }

    #[tokio::test]
    async fn test_processor_timeout_is_retryable() {
        let store = Arc::new(InMemoryJobInstanceStore::new());
        let id = store
            .insert(NewJobInstance::new("slow", Utc::now()))
            .await
            .unwrap();
        let key = Arc::new(PartitionKey::builder("notifications").build().unwrap());
        let actor = ConsumingActor::new(
            key,
            store.clone(),
            Arc::new(Sleepy),
            Arc::new(RetryPolicy::with_max_retries(2)),
            Arc::new(WorkerPool::new(WorkerPoolConfig::default())),
            ConsumingActorConfig {
                processor_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            CancellationToken::new(),
            EventBroadcaster::new(),
        );

        let report = actor.drain_cycle().await.unwrap();

        assert_eq!(report.deferred, 1);
        let stored = store.get("job_instance", id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobInstanceState::Deferred);
        assert_eq!(stored.failure_count, 1);
        assert!(stored.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_stopped_actor_refuses_cycles() {
        let store = Arc::new(InMemoryJobInstanceStore::new());
        store.insert(NewJobInstance::new("job", Utc::now())).await.unwrap();
        let processor = Recording::new(ProcessOutcome::done());
        let actor = actor(store.clone(), processor.clone(), 10);

        actor.stop();
        let report = actor.drain_cycle().await.unwrap();

        assert!(report.stopped);
        assert_eq!(actor.run_state(), ActorRunState::Stopped);
        assert!(processor.seen.lock().is_empty());
        assert_eq!(store.count_in_state(JobInstanceState::New), 1);
    }

    #[tokio::test]
    async fn test_suspends_while_admission_is_saturated() {
        let store = Arc::new(InMemoryJobInstanceStore::new());
        store.insert(NewJobInstance::new("job", Utc::now())).await.unwrap();
        let actor = Arc::new(actor(store.clone(), Recording::new(ProcessOutcome::done()), 10));

        // Hold every admission permit.
        let mut held = Vec::new();
        while let Some(permit) = actor.pool.try_admit() {
            held.push(permit);
        }

        let cycle = tokio::spawn({
            let actor = actor.clone();
            async move { actor.drain_cycle().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(actor.run_state(), ActorRunState::Suspended);
        assert_eq!(store.count_in_state(JobInstanceState::New), 1);

        drop(held);
        let report = cycle.await.unwrap().unwrap();
        assert_eq!(report.done, 1);
        assert_eq!(actor.metrics().snapshot().suspensions, 1);
    }
}
