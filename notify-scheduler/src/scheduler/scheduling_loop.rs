//! The single task that owns the wake schedule.
//!
//! Everything that changes the schedule arrives here as a
//! [`SchedulerCommand`]: actor registration, listener wakes and finished
//! drain cycles. The loop sleeps until the earliest wake time or the next
//! command, submits due actors to the worker pool, and re-arms each actor
//! with the due time its cycle reported.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::actor::{ConsumingActor, CycleError, CycleResult, panic_message};
use super::events::{EventBroadcaster, SchedulerEvent};
use super::wake_queue::WakeQueue;
use super::worker_pool::{SubmitError, WorkerPool};
use crate::config::SchedulerConfig;
use crate::domain::capped_exponential;

/// Longest single sleep for a partition. Far-future due times are re-checked
/// after this long instead of arming a timer years ahead.
const MAX_WAKE_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

pub(crate) enum SchedulerCommand {
    Register {
        slot: usize,
        actor: Arc<ConsumingActor>,
        pending: Arc<AtomicBool>,
        initial_due: Option<DateTime<Utc>>,
    },
    Wake {
        slot: usize,
    },
    CycleFinished {
        slot: usize,
        result: CycleResult,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct LoopConfig {
    pub poll_interval: Option<Duration>,
    pub submit_backoff_base: Duration,
    pub submit_backoff_max: Duration,
    pub store_backoff_base: Duration,
    pub store_backoff_max: Duration,
}

impl From<&SchedulerConfig> for LoopConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            submit_backoff_base: config.submit_backoff_base,
            submit_backoff_max: config.submit_backoff_max,
            store_backoff_base: config.store_backoff_base,
            store_backoff_max: config.store_backoff_max,
        }
    }
}

struct Slot {
    actor: Arc<ConsumingActor>,
    pending: Arc<AtomicBool>,
    /// A cycle is submitted or running.
    running: bool,
    /// A wake arrived while running; re-run as soon as the cycle ends.
    rerun: bool,
    submit_attempts: u32,
    store_failures: u32,
}

pub(crate) struct SchedulingLoop {
    queue: WakeQueue,
    slots: HashMap<usize, Slot>,
    commands_rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    commands_tx: mpsc::UnboundedSender<SchedulerCommand>,
    pool: Arc<WorkerPool>,
    events: EventBroadcaster,
    config: LoopConfig,
    cancellation_token: CancellationToken,
}

impl SchedulingLoop {
    pub(crate) fn new(
        commands_rx: mpsc::UnboundedReceiver<SchedulerCommand>,
        commands_tx: mpsc::UnboundedSender<SchedulerCommand>,
        pool: Arc<WorkerPool>,
        events: EventBroadcaster,
        config: LoopConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            queue: WakeQueue::new(),
            slots: HashMap::new(),
            commands_rx,
            commands_tx,
            pool,
            events,
            config,
            cancellation_token,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Scheduling loop started");

        loop {
            // Compute before select to avoid borrowing the queue inside it.
            let deadline = self.queue.next_deadline();
            let wake_timer = Self::wake_timer(deadline);

            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    debug!("Scheduling loop cancelled");
                    break;
                }

                Some(command) = self.commands_rx.recv() => {
                    self.handle(command);
                }

                _ = wake_timer => {
                    self.dispatch_due();
                }
            }
        }

        debug!(
            "Scheduling loop stopped with {} partitions, {} scheduled",
            self.slots.len(),
            self.queue.len()
        );
    }

    async fn wake_timer(deadline: Option<Instant>) {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    }

    fn handle(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Register {
                slot,
                actor,
                pending,
                initial_due,
            } => {
                let at = wake_at(self.config.poll_interval, initial_due);
                trace!(partition = %actor.name(), slot, "Registered with scheduling loop");
                self.slots.insert(
                    slot,
                    Slot {
                        actor,
                        pending,
                        running: false,
                        rerun: false,
                        submit_attempts: 0,
                        store_failures: 0,
                    },
                );
                if let Some(at) = at {
                    self.queue.schedule(slot, at);
                }
            }
            SchedulerCommand::Wake { slot } => self.wake(slot),
            SchedulerCommand::CycleFinished { slot, result } => self.cycle_finished(slot, result),
        }
    }

    fn wake(&mut self, slot: usize) {
        let Some(state) = self.slots.get_mut(&slot) else {
            return;
        };
        state.pending.store(false, Ordering::Release);
        if state.actor.is_stopped() {
            return;
        }
        state.actor.metrics().record_early_wake();

        if state.running {
            trace!(partition = %state.actor.name(), "Wake while draining, will re-run");
            state.rerun = true;
        } else {
            self.queue.schedule(slot, Instant::now());
        }
    }

    fn dispatch_due(&mut self) {
        let now = Instant::now();
        while let Some(slot) = self.queue.pop_due(now) {
            self.dispatch(slot);
        }
    }

    fn dispatch(&mut self, slot: usize) {
        let Some(state) = self.slots.get_mut(&slot) else {
            return;
        };
        if state.actor.is_stopped() {
            return;
        }
        if state.running {
            state.rerun = true;
            return;
        }

        let actor = state.actor.clone();
        let commands = self.commands_tx.clone();
        let cycle = async move {
            let result = match AssertUnwindSafe(actor.drain_cycle()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    actor.mark_idle();
                    Err(CycleError::Panicked {
                        partition: actor.name().to_string(),
                        message: panic_message(panic.as_ref()),
                    })
                }
            };
            // The loop may already be gone during shutdown.
            let _ = commands.send(SchedulerCommand::CycleFinished { slot, result });
        };

        match self.pool.try_submit(cycle) {
            Ok(()) => {
                state.running = true;
                state.submit_attempts = 0;
            }
            Err(SubmitError::Saturated) => {
                let attempt = state.submit_attempts;
                state.submit_attempts = attempt.saturating_add(1);
                let delay = capped_exponential(
                    self.config.submit_backoff_base,
                    self.config.submit_backoff_max,
                    attempt,
                );
                warn!(
                    partition = %state.actor.name(),
                    attempt = attempt + 1,
                    "Worker pool saturated, retrying submission in {:?}",
                    delay
                );
                self.events.publish(SchedulerEvent::PoolSaturated {
                    partition: state.actor.name().to_string(),
                    attempt: attempt + 1,
                    retry_in: delay,
                });
                self.queue.schedule(slot, Instant::now() + delay);
            }
            Err(SubmitError::Closed) => {
                debug!(partition = %state.actor.name(), "Worker pool closed, not submitting");
            }
        }
    }

    fn cycle_finished(&mut self, slot: usize, result: CycleResult) {
        let Some(state) = self.slots.get_mut(&slot) else {
            return;
        };
        state.running = false;
        let rerun = std::mem::take(&mut state.rerun);
        if state.actor.is_stopped() {
            return;
        }

        match result {
            Ok(report) => {
                state.store_failures = 0;
                if report.stopped {
                    return;
                }
                let at = if rerun {
                    Some(Instant::now())
                } else {
                    wake_at(self.config.poll_interval, report.next_due)
                };
                if let Some(at) = at {
                    self.queue.schedule(slot, at);
                }
            }
            Err(err) => {
                let attempt = state.store_failures;
                state.store_failures = attempt.saturating_add(1);
                let delay = capped_exponential(
                    self.config.store_backoff_base,
                    self.config.store_backoff_max,
                    attempt,
                );
                match &err {
                    CycleError::Panicked { .. } => error!(
                        partition = %state.actor.name(),
                        "{}; retrying in {:?}",
                        err,
                        delay
                    ),
                    CycleError::StoreUnavailable { .. } => {
                        warn!(
                            partition = %state.actor.name(),
                            consecutive_failures = attempt + 1,
                            "Drain cycle aborted: {}; retrying in {:?}",
                            err,
                            delay
                        );
                        self.events.publish(SchedulerEvent::StoreUnavailable {
                            partition: state.actor.name().to_string(),
                            consecutive_failures: attempt + 1,
                            error: err.to_string(),
                            retry_in: delay,
                        });
                    }
                }
                self.queue.schedule(slot, Instant::now() + delay);
            }
        }
    }
}

/// Wake time for a partition whose earliest pending instance is `next_due`,
/// bounded by the poll fallback.
fn wake_at(poll_interval: Option<Duration>, next_due: Option<DateTime<Utc>>) -> Option<Instant> {
    let now = Instant::now();
    let due = next_due.map(|due| {
        let delay = (due - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_WAKE_DELAY);
        now + delay
    });
    let poll = poll_interval.map(|interval| now + interval.min(MAX_WAKE_DELAY));
    match (due, poll) {
        (Some(due), Some(poll)) => Some(due.min(poll)),
        (due, poll) => due.or(poll),
    }
}
