//! In-memory retry spool for writes the durable store rejected.
//!
//! Writes are replayed in arrival order with exponential backoff and jitter.
//! The spool is bounded; on overflow the oldest write is dropped with a
//! warning, so the most recent learning update is always retained.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use tracing::{debug, info, warn};

use super::{StorageError, Store};
use crate::config::StorageConfig;
use crate::detect::{AnomalyEvent, Cluster, IndexSnapshot};
use crate::patterns::calibration::BrierAccumulator;
use crate::patterns::tracker::RecentCondition;
use crate::patterns::{PatternEntry, Prediction};
use crate::sensor::Reading;

/// One deferred store write.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    Reading(Reading),
    Anomaly(AnomalyEvent),
    Cluster(Cluster),
    Index(IndexSnapshot),
    Predictions(Vec<Prediction>),
    Patterns(Vec<PatternEntry>),
    RecentConditions(Vec<RecentCondition>),
    Calibration(std::collections::BTreeMap<String, BrierAccumulator>),
}

impl PendingWrite {
    pub fn kind(&self) -> &'static str {
        match self {
            PendingWrite::Reading(_) => "reading",
            PendingWrite::Anomaly(_) => "anomaly",
            PendingWrite::Cluster(_) => "cluster",
            PendingWrite::Index(_) => "index",
            PendingWrite::Predictions(_) => "predictions",
            PendingWrite::Patterns(_) => "patterns",
            PendingWrite::RecentConditions(_) => "recent_conditions",
            PendingWrite::Calibration(_) => "calibration",
        }
    }

    /// Whole-state snapshots where only the newest matters.
    fn supersedes(&self, other: &PendingWrite) -> bool {
        matches!(
            (self, other),
            (PendingWrite::Predictions(_), PendingWrite::Predictions(_))
                | (PendingWrite::RecentConditions(_), PendingWrite::RecentConditions(_))
                | (PendingWrite::Calibration(_), PendingWrite::Calibration(_))
        )
    }

    pub fn apply(&self, store: &Store) -> Result<()> {
        match self {
            PendingWrite::Reading(r) => store.save_reading(r),
            PendingWrite::Anomaly(a) => store.save_anomaly(a),
            PendingWrite::Cluster(c) => store.save_cluster(c),
            PendingWrite::Index(s) => store.save_index(s),
            PendingWrite::Predictions(p) => store.replace_predictions(p),
            PendingWrite::Patterns(p) => store.save_patterns(p),
            PendingWrite::RecentConditions(r) => store.save_recent_conditions(r),
            PendingWrite::Calibration(c) => store.save_calibration(c),
        }
    }
}

pub struct RetrySpool {
    queue: VecDeque<PendingWrite>,
    capacity: usize,
    base: Duration,
    max: Duration,
    attempts: u32,
    next_attempt: Option<Instant>,
    dropped: u64,
}

impl RetrySpool {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: config.retry_capacity.max(1),
            base: Duration::from_millis(config.retry_base_ms),
            max: Duration::from_millis(config.retry_max_ms),
            attempts: 0,
            next_attempt: None,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queue a write for later replay.
    pub fn push(&mut self, write: PendingWrite) {
        self.queue.retain(|w| !write.supersedes(w));
        if self.queue.len() >= self.capacity {
            if let Some(old) = self.queue.pop_front() {
                self.dropped += 1;
                warn!(kind = old.kind(), capacity = self.capacity, "retry spool full, dropped oldest write");
            }
        }
        self.queue.push_back(write);
        if self.next_attempt.is_none() {
            self.schedule_retry();
        }
    }

    /// Delay before the next replay attempt: `base * 2^attempts`, capped,
    /// with up to 20% jitter.
    pub fn backoff(&self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempts.min(16));
        let capped = exp.min(self.max);
        let jitter = rand::thread_rng().gen_range(0.0..0.2);
        capped.mul_f64(1.0 + jitter).min(self.max)
    }

    fn schedule_retry(&mut self) {
        self.next_attempt = Some(Instant::now() + self.backoff());
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_attempt.is_some_and(|t| now >= t)
    }

    /// Write `write` directly when nothing is queued, otherwise queue it
    /// behind the pending writes so order is preserved.
    pub fn write_or_spool(&mut self, store: &Store, write: PendingWrite) -> Result<(), StorageError> {
        if !self.queue.is_empty() {
            self.push(write);
            return self.flush_if_due(store, Instant::now()).map(|_| ());
        }
        match write.apply(store) {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = StorageError::classify(&e);
                if err.is_corrupt() {
                    return Err(err);
                }
                warn!(kind = write.kind(), error = %err, "store write failed, spooling for retry");
                self.push(write);
                Ok(())
            }
        }
    }

    pub fn flush_if_due(&mut self, store: &Store, now: Instant) -> Result<usize, StorageError> {
        if !self.is_due(now) {
            return Ok(0);
        }
        self.flush(store)
    }

    /// Replay queued writes in order, stopping at the first failure.
    pub fn flush(&mut self, store: &Store) -> Result<usize, StorageError> {
        let mut written = 0;
        while let Some(write) = self.queue.front() {
            match write.apply(store) {
                Ok(()) => {
                    self.queue.pop_front();
                    written += 1;
                }
                Err(e) => {
                    let err = StorageError::classify(&e);
                    if err.is_corrupt() {
                        return Err(err);
                    }
                    self.attempts = self.attempts.saturating_add(1);
                    self.schedule_retry();
                    warn!(
                        pending = self.queue.len(),
                        attempts = self.attempts,
                        error = %err,
                        "spool replay failed, backing off"
                    );
                    return Ok(written);
                }
            }
        }
        if written > 0 {
            info!(written, "retry spool drained");
        } else {
            debug!("retry spool empty");
        }
        self.attempts = 0;
        self.next_attempt = None;
        Ok(written)
    }
}
