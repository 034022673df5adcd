//! Combined wake schedule for all partitions.
//!
//! Owned exclusively by the scheduling loop. Each partition slot has at most
//! one live entry; scheduling an earlier time supersedes a later one, and
//! superseded heap entries are discarded lazily via a per-slot generation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WakeEntry {
    at: Instant,
    generation: u64,
    slot: usize,
}

#[derive(Debug, Default)]
pub struct WakeQueue {
    heap: BinaryHeap<Reverse<WakeEntry>>,
    live: HashMap<usize, (Instant, u64)>,
    next_generation: u64,
}

impl WakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `slot` at `at` unless it is already scheduled no later.
    /// Returns whether the schedule changed.
    pub fn schedule(&mut self, slot: usize, at: Instant) -> bool {
        if let Some((current, _)) = self.live.get(&slot) {
            if *current <= at {
                return false;
            }
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.live.insert(slot, (at, generation));
        self.heap.push(Reverse(WakeEntry {
            at,
            generation,
            slot,
        }));
        true
    }

    pub fn scheduled_at(&self, slot: usize) -> Option<Instant> {
        self.live.get(&slot).map(|(at, _)| *at)
    }

    /// Earliest live wake time.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|Reverse(entry)| entry.at)
    }

    /// Pop the earliest slot due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<usize> {
        self.discard_stale();
        match self.heap.peek().copied() {
            Some(Reverse(entry)) if entry.at <= now => {
                let slot = entry.slot;
                self.heap.pop();
                self.live.remove(&slot);
                Some(slot)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek().copied() {
            match self.live.get(&entry.slot) {
                Some((_, generation)) if *generation == entry.generation => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}
