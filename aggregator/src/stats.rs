use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Raw pipeline counters. Only ever updated as a whole, under one lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub received: u64,
    pub unique_processed: u64,
    pub duplicate_dropped: u64,
    pub processing_failed: u64,
    /// Duplicates caught by the commit itself after the consumer's `exists`
    /// check missed them. Already included in `duplicate_dropped`.
    pub commit_races: u64,
}

impl Counters {
    /// Events that reached a terminal state.
    pub fn settled(&self) -> u64 {
        self.unique_processed + self.duplicate_dropped + self.processing_failed
    }
}

/// Point-in-time view served on `/stats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub unique_processed: u64,
    pub duplicate_dropped: u64,
    pub processing_failed: u64,
    pub commit_races: u64,
    pub topics: Vec<String>,
    pub uptime_seconds: f64,
    pub duplicate_rate: f64,
}

/// Fraction of received events that were dropped as duplicates, 0 when nothing
/// was received.
pub fn duplicate_rate(duplicates: u64, received: u64) -> f64 {
    if received == 0 {
        return 0.0;
    }
    duplicates as f64 / received as f64
}

pub struct Statistics {
    counters: Mutex<Counters>,
    started: Instant,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Counters)) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut counters)
    }

    pub fn record_received(&self, count: u64) {
        self.update(|c| c.received += count)
    }

    /// Events turned away before reaching the queue: received and dropped in
    /// the same update.
    pub fn record_rejected_duplicates(&self, count: u64) {
        self.update(|c| {
            c.received += count;
            c.duplicate_dropped += count;
        })
    }

    pub fn record_committed(&self) {
        self.update(|c| c.unique_processed += 1)
    }

    pub fn record_duplicate(&self) {
        self.update(|c| c.duplicate_dropped += 1)
    }

    pub fn record_commit_race(&self) {
        self.update(|c| {
            c.duplicate_dropped += 1;
            c.commit_races += 1;
        })
    }

    pub fn record_failure(&self) {
        self.update(|c| c.processing_failed += 1)
    }

    pub fn counters(&self) -> Counters {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Snapshot with uptime and duplicate rate computed now.
    pub fn snapshot(&self, topics: Vec<String>) -> StatsSnapshot {
        let counters = self.counters();
        StatsSnapshot {
            received: counters.received,
            unique_processed: counters.unique_processed,
            duplicate_dropped: counters.duplicate_dropped,
            processing_failed: counters.processing_failed,
            commit_races: counters.commit_races,
            topics,
            uptime_seconds: self.uptime_seconds(),
            duplicate_rate: duplicate_rate(counters.duplicate_dropped, counters.received),
        }
    }
}
