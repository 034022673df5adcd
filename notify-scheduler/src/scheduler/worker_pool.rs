//! Bounded worker pool for drain cycles.
//!
//! Two limits apply. `pool_size` cycles run at once and at most
//! `queue_capacity` more may wait for a worker; beyond that
//! [`WorkerPool::try_submit`] refuses instead of queueing without bound.
//! Independently, `max_in_flight` caps concurrent processor invocations
//! across all partitions; actors that cannot get an admission permit suspend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent drain cycles.
    pub pool_size: usize,
    /// Submitted cycles allowed to wait for a worker.
    pub queue_capacity: usize,
    /// Maximum concurrent processor invocations.
    pub max_in_flight: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: 64,
            max_in_flight: 4,
        }
    }
}

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Every worker is busy and the wait queue is full.
    Saturated,
    /// The pool has been shut down.
    Closed,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Saturated => write!(f, "worker pool saturated"),
            SubmitError::Closed => write!(f, "worker pool closed"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Outcome of [`WorkerPool::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolShutdown {
    /// Tasks that finished within the grace period.
    pub completed: usize,
    /// Tasks aborted when the grace period ran out.
    pub aborted: usize,
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Running cycles.
    workers: Arc<Semaphore>,
    /// Running plus waiting cycles.
    slots: Arc<Semaphore>,
    /// Processor admissions.
    in_flight: Arc<Semaphore>,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let pool_size = config.pool_size.max(1);
        let max_in_flight = config.max_in_flight.max(1);
        Self {
            workers: Arc::new(Semaphore::new(pool_size)),
            slots: Arc::new(Semaphore::new(pool_size + config.queue_capacity)),
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
            config,
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Submit a task without waiting.
    pub fn try_submit<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.tasks.lock();
        let Some(tasks) = guard.as_mut() else {
            return Err(SubmitError::Closed);
        };

        // Reap finished tasks so the set does not grow over the service lifetime.
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Worker task panicked: {}", e);
                }
            }
        }

        let slot = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(SubmitError::Saturated),
            Err(TryAcquireError::Closed) => return Err(SubmitError::Closed),
        };

        let workers = self.workers.clone();
        tasks.spawn(async move {
            let _slot = slot;
            let Ok(_worker) = workers.acquire_owned().await else {
                return;
            };
            task.await;
        });
        Ok(())
    }

    /// Take a processor admission permit if one is free.
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        self.in_flight.clone().try_acquire_owned().ok()
    }

    /// Cycles running or waiting for a worker.
    pub fn queued_count(&self) -> usize {
        (self.config.pool_size.max(1) + self.config.queue_capacity)
            .saturating_sub(self.slots.available_permits())
    }

    pub fn is_closed(&self) -> bool {
        self.tasks.lock().is_none()
    }

    /// Stop accepting work, wait up to `grace` for submitted tasks, then
    /// abort whatever is left. Calling it again returns an empty report.
    pub async fn shutdown(&self, grace: Duration) -> PoolShutdown {
        let tasks = self.tasks.lock().take();
        let Some(mut tasks) = tasks else {
            return PoolShutdown::default();
        };
        self.slots.close();

        let pending = tasks.len();
        info!("Worker pool shutting down, waiting for {} tasks", pending);

        let mut report = PoolShutdown::default();
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                joined = tasks.join_next() => match joined {
                    Some(Ok(())) => report.completed += 1,
                    Some(Err(e)) => {
                        if e.is_panic() {
                            error!("Worker task panicked during shutdown: {}", e);
                        }
                        report.completed += 1;
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        "Worker pool grace period of {:?} elapsed with {} tasks still running, aborting",
                        grace,
                        tasks.len()
                    );
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        match joined {
                            Err(e) if e.is_cancelled() => report.aborted += 1,
                            _ => report.completed += 1,
                        }
                    }
                    break;
                }
            }
        }

        debug!(
            "Worker pool stopped: {} completed, {} aborted",
            report.completed, report.aborted
        );
        report
    }
}
