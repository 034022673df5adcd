//! Job instance store contract.
//!
//! The scheduler never talks to a database directly. Everything it needs
//! from durable storage goes through [`JobInstanceStore`]; implementations
//! must be usable concurrently from many partitions and must make
//! [`JobInstanceStore::try_claim`] and [`JobInstanceStore::commit`]
//! conditional updates, so that at most one claimant wins per instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;
use crate::domain::{JobInstance, JobInstanceState, NewJobInstance, PartitionKey, Transition};

#[async_trait]
pub trait JobInstanceStore: Send + Sync {
    /// Number of instances in the key's ready set with `due_at <= now`.
    async fn count_ready(&self, key: &PartitionKey, now: DateTime<Utc>) -> Result<u64>;

    /// Up to `limit` ready instances with `due_at <= now`, ordered by due
    /// time then id, ascending.
    async fn fetch_ready_batch(
        &self,
        key: &PartitionKey,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobInstance>>;

    /// Move `id` from `expected` to `RUNNING` if it is still in `expected`.
    ///
    /// Returns `false` when another claimant got there first or the instance
    /// left the ready set.
    async fn try_claim(
        &self,
        key: &PartitionKey,
        id: i64,
        expected: JobInstanceState,
    ) -> Result<bool>;

    /// Apply `transition` to a `RUNNING` instance.
    ///
    /// Fails with `InvalidStateTransition` if the instance is not `RUNNING`
    /// or the lifecycle forbids the target state.
    async fn commit(&self, key: &PartitionKey, id: i64, transition: Transition) -> Result<()>;

    /// Earliest due time among the key's ready instances, due or not.
    async fn next_due_time(&self, key: &PartitionKey) -> Result<Option<DateTime<Utc>>>;

    /// Store a fresh `NEW` instance and return its id.
    async fn insert(&self, instance: NewJobInstance) -> Result<i64>;

    async fn get(&self, instance_type: &str, id: i64) -> Result<Option<JobInstance>>;

    /// Return `RUNNING` instances of the partition claimed before
    /// `claimed_before` to `DEFERRED`. Returns how many were reset.
    async fn reset_stale_running(
        &self,
        key: &PartitionKey,
        claimed_before: DateTime<Utc>,
    ) -> Result<u64>;
}

/// Shared precondition checks for store implementations.
pub(crate) fn check_claim_expected(id: i64, expected: JobInstanceState) -> Result<()> {
    if expected.is_claimable() {
        Ok(())
    } else {
        Err(crate::Error::validation(format!(
            "cannot claim instance {} from non-ready state {}",
            id, expected
        )))
    }
}

pub(crate) fn check_commit_target(transition: &Transition) -> Result<()> {
    if JobInstanceState::Running.can_transition_to(transition.state) {
        Ok(())
    } else {
        Err(crate::Error::invalid_transition(
            JobInstanceState::Running,
            transition.state,
        ))
    }
}
