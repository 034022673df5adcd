//! Per-partition actor metrics for observability.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

/// Recent drain-cycle durations kept for averaging.
const CYCLE_SAMPLE_CAPACITY: usize = 64;

/// Metrics for one consuming actor.
#[derive(Debug)]
pub struct ActorMetrics {
    partition: String,
    cycles: AtomicU64,
    claimed: AtomicU64,
    lost_claims: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
    deferred: AtomicU64,
    store_errors: AtomicU64,
    early_wakes: AtomicU64,
    suspensions: AtomicU64,
    cycle_samples: RwLock<CycleSamples>,
    spawned_at: Instant,
}

/// Ring buffer of recent cycle durations (microseconds).
#[derive(Debug)]
struct CycleSamples {
    samples: Vec<u64>,
    position: usize,
    count: u64,
    last: u64,
    max: u64,
}

impl CycleSamples {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0; capacity],
            position: 0,
            count: 0,
            last: 0,
            max: 0,
        }
    }

    fn record(&mut self, duration_us: u64) {
        self.samples[self.position] = duration_us;
        self.position = (self.position + 1) % self.samples.len();
        self.count += 1;
        self.last = duration_us;
        self.max = self.max.max(duration_us);
    }

    fn recent_average(&self) -> f64 {
        let filled = self.count.min(self.samples.len() as u64) as usize;
        if filled == 0 {
            return 0.0;
        }
        let sum: u64 = self.samples[..filled].iter().sum();
        sum as f64 / filled as f64
    }
}

/// Point-in-time copy of [`ActorMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub partition: String,
    pub cycles: u64,
    pub claimed: u64,
    pub lost_claims: u64,
    pub done: u64,
    pub failed: u64,
    pub deferred: u64,
    pub store_errors: u64,
    pub early_wakes: u64,
    pub suspensions: u64,
    pub last_cycle_us: u64,
    pub max_cycle_us: u64,
    pub avg_cycle_us: f64,
    pub uptime_secs: u64,
}

impl ActorMetrics {
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            cycles: AtomicU64::new(0),
            claimed: AtomicU64::new(0),
            lost_claims: AtomicU64::new(0),
            done: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            early_wakes: AtomicU64::new(0),
            suspensions: AtomicU64::new(0),
            cycle_samples: RwLock::new(CycleSamples::new(CYCLE_SAMPLE_CAPACITY)),
            spawned_at: Instant::now(),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn record_cycle(&self, duration: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.cycle_samples.write().record(duration.as_micros() as u64);
    }

    pub fn record_claimed(&self) {
        self.claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost_claim(&self) {
        self.lost_claims.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_done(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_early_wake(&self) {
        self.early_wakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspension(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.cycle_samples.read();
        MetricsSnapshot {
            partition: self.partition.clone(),
            cycles: self.cycles.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            lost_claims: self.lost_claims.load(Ordering::Relaxed),
            done: self.done.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            early_wakes: self.early_wakes.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            last_cycle_us: samples.last,
            max_cycle_us: samples.max,
            avg_cycle_us: samples.recent_average(),
            uptime_secs: self.spawned_at.elapsed().as_secs(),
        }
    }
}
