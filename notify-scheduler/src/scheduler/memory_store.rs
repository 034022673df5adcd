//! In-memory job instance store.
//!
//! Used for tests and for embedding the scheduler without a database. All
//! conditional updates happen under one write lock, which makes claims and
//! commits linearizable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::listener::ListenerRegistry;
use super::store::{JobInstanceStore, check_claim_expected, check_commit_target};
use crate::domain::{JobInstance, JobInstanceState, NewJobInstance, PartitionKey, Transition};
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct InMemoryJobInstanceStore {
    instances: RwLock<BTreeMap<i64, JobInstance>>,
    next_id: AtomicI64,
    listeners: Option<ListenerRegistry>,
}

impl InMemoryJobInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notify `listeners` about every inserted instance.
    pub fn with_listeners(mut self, listeners: ListenerRegistry) -> Self {
        self.listeners = Some(listeners);
        self
    }

    /// All instances, ordered by id.
    pub fn snapshot(&self) -> Vec<JobInstance> {
        self.instances.read().values().cloned().collect()
    }

    pub fn count_in_state(&self, state: JobInstanceState) -> usize {
        self.instances
            .read()
            .values()
            .filter(|i| i.state == state)
            .count()
    }

    /// Overwrite a stored instance, bypassing the lifecycle checks.
    ///
    /// Meant for seeding fixtures such as stale `RUNNING` claims.
    pub fn put(&self, instance: JobInstance) {
        self.next_id.fetch_max(instance.id, Ordering::SeqCst);
        self.instances.write().insert(instance.id, instance);
    }

    fn ready_sorted(&self, key: &PartitionKey, now: DateTime<Utc>) -> Vec<JobInstance> {
        let mut ready: Vec<JobInstance> = self
            .instances
            .read()
            .values()
            .filter(|i| key.is_ready(i, now))
            .cloned()
            .collect();
        ready.sort_by_key(|i| (i.due_at, i.id));
        ready
    }
}

#[async_trait]
impl JobInstanceStore for InMemoryJobInstanceStore {
    async fn count_ready(&self, key: &PartitionKey, now: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| key.is_ready(i, now))
            .count() as u64)
    }

    async fn fetch_ready_batch(
        &self,
        key: &PartitionKey,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobInstance>> {
        let mut ready = self.ready_sorted(key, now);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn try_claim(
        &self,
        key: &PartitionKey,
        id: i64,
        expected: JobInstanceState,
    ) -> Result<bool> {
        check_claim_expected(id, expected)?;
        let mut instances = self.instances.write();
        match instances.get_mut(&id) {
            Some(instance) if instance.state == expected && key.matches(instance) => {
                instance.state = JobInstanceState::Running;
                instance.claimed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(&self, _key: &PartitionKey, id: i64, transition: Transition) -> Result<()> {
        check_commit_target(&transition)?;
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("JobInstance", id.to_string()))?;
        if instance.state != JobInstanceState::Running {
            return Err(Error::invalid_transition(instance.state, transition.state));
        }
        transition.apply(instance);
        Ok(())
    }

    async fn next_due_time(&self, key: &PartitionKey) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| key.matches(i) && key.is_ready_state(i.state))
            .map(|i| i.due_at)
            .min())
    }

    async fn insert(&self, instance: NewJobInstance) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let instance = instance.into_instance(id, Utc::now());
        let notify = self.listeners.as_ref().map(|_| instance.clone());
        self.instances.write().insert(id, instance);

        if let (Some(listeners), Some(instance)) = (&self.listeners, notify) {
            listeners.notify_instance(&instance);
        }
        Ok(id)
    }

    async fn get(&self, instance_type: &str, id: i64) -> Result<Option<JobInstance>> {
        Ok(self
            .instances
            .read()
            .get(&id)
            .filter(|i| i.instance_type == instance_type)
            .cloned())
    }

    async fn reset_stale_running(
        &self,
        key: &PartitionKey,
        claimed_before: DateTime<Utc>,
    ) -> Result<u64> {
        let mut reset = 0;
        for instance in self.instances.write().values_mut() {
            let stale = instance.claimed_at.is_none_or(|at| at < claimed_before);
            if instance.state == JobInstanceState::Running && key.matches(instance) && stale {
                instance.state = JobInstanceState::Deferred;
                instance.claimed_at = None;
                reset += 1;
            }
        }
        Ok(reset)
    }
}
