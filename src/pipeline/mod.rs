//! The live analysis stage.
//!
//! One task owns every piece of live-path state (parameter windows, open
//! clusters, the index accumulator, the pattern table) and processes readings
//! strictly one at a time. Everything other tasks see is an immutable
//! [`StatusSnapshot`] republished after each step.

pub mod bus;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::detect::anomaly::WindowStats;
use crate::detect::{AnomalyDetector, AnomalyEvent, Cluster, ClusterDetector, IndexCalculator, IndexSnapshot};
use crate::notify::{self, Notifier};
use crate::patterns::calibration::CalibrationSummary;
use crate::patterns::{CalibrationTracker, Condition, EventDetector, PatternTracker, PredictionStore};
use crate::sensor::Reading;
use crate::storage::{PendingWrite, RetrySpool, StorageError, Store};

pub use self::bus::{BusReceiver, ReadingBus};

/// Read-only view of the live stage for the status surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub updated_at: f64,
    pub readings_processed: u64,
    pub anomalies_detected: u64,
    pub clusters_closed: u64,
    pub significant_clusters: u64,
    pub open_clusters: usize,
    pub windows: Vec<WindowStats>,
    pub last_anomaly: BTreeMap<String, f64>,
    pub tracker_sample_sizes: BTreeMap<String, u64>,
    pub pattern_entries: usize,
    pub dropped_readings: u64,
    pub spool_depth: usize,
    pub spool_dropped: u64,
    pub store_corrupt: bool,
    pub active_predictions: usize,
    pub latest_index: Option<IndexSnapshot>,
    pub calibration: CalibrationSummary,
}

pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

#[derive(Default)]
struct Counters {
    readings: u64,
    anomalies: u64,
    clusters: u64,
    significant: u64,
}

pub struct Stage {
    config: Config,
    detector: AnomalyDetector,
    events: EventDetector,
    clusters: ClusterDetector,
    index: IndexCalculator,
    tracker: PatternTracker,
    predictions: Arc<PredictionStore>,
    store: Store,
    spool: RetrySpool,
    notifier: Arc<dyn Notifier>,
    bus: ReadingBus,
    status: SharedStatus,
    recent_anomalies: VecDeque<AnomalyEvent>,
    latest_index: Option<IndexSnapshot>,
    last_index_at: Option<f64>,
    last_refresh_at: Option<f64>,
    counters: Counters,
    corrupt: bool,
}

impl Stage {
    /// Build the stage, restoring learned state from `store` as of `now`.
    pub fn new(
        config: Config,
        store: Store,
        predictions: Arc<PredictionStore>,
        notifier: Arc<dyn Notifier>,
        bus: ReadingBus,
        status: SharedStatus,
        now: f64,
    ) -> Self {
        let events = EventDetector::default();
        let mut tracker = PatternTracker::new(
            config.patterns.clone(),
            events
                .definitions()
                .iter()
                .map(|d| (d.event_type.to_string(), d.category)),
        );

        let lookahead = config.patterns.lookahead_hours * 3600.0;
        match (store.load_patterns(), store.load_recent_conditions(now - lookahead)) {
            (Ok(entries), Ok(recent)) => tracker.restore(entries, recent, now),
            (Err(e), _) | (_, Err(e)) => warn!(error = %e, "could not restore pattern state, starting fresh"),
        }
        match store.load_calibration() {
            Ok(acc) => *tracker.calibration_mut() = CalibrationTracker::restore(acc),
            Err(e) => warn!(error = %e, "could not restore calibration state"),
        }

        Self {
            detector: AnomalyDetector::new(config.detector.clone()),
            clusters: ClusterDetector::new(&config.cluster),
            index: IndexCalculator::new(&config.index),
            spool: RetrySpool::new(&config.storage),
            events,
            tracker,
            predictions,
            store,
            notifier,
            bus,
            status,
            recent_anomalies: VecDeque::new(),
            latest_index: None,
            last_index_at: None,
            last_refresh_at: None,
            counters: Counters::default(),
            corrupt: false,
            config,
        }
    }

    pub fn tracker(&self) -> &PatternTracker {
        &self.tracker
    }

    pub fn spool_depth(&self) -> usize {
        self.spool.len()
    }

    /// Run the full live path for one reading. The reading's timestamp is
    /// the stage clock for everything it triggers.
    pub fn handle_reading(&mut self, reading: Reading) {
        let now = reading.timestamp;
        self.counters.readings += 1;

        let anomalies = self.detector.process(&reading);
        let observed = self.events.check(&reading);
        self.persist(PendingWrite::Reading(reading));

        for anomaly in anomalies {
            self.counters.anomalies += 1;
            self.persist(PendingWrite::Anomaly(anomaly.clone()));
            self.recent_anomalies.push_back(anomaly.clone());
            for cluster in self.clusters.add(anomaly) {
                self.handle_cluster(cluster, now);
            }
        }

        for event in &observed {
            let credited = self.tracker.observe_event(event);
            info!(
                event_type = %event.event_type,
                category = %event.category,
                timestamp = event.timestamp,
                credited,
                "real-world event observed"
            );
        }
    }

    fn handle_cluster(&mut self, cluster: Cluster, now: f64) {
        self.counters.clusters += 1;
        self.persist(PendingWrite::Cluster(cluster.clone()));

        let condition = Condition::from_cluster(&cluster);
        self.tracker.record_condition(condition.clone());
        if !cluster.significant {
            debug!(cluster_id = %cluster.id, level = cluster.level, "cluster kept for learning only");
            return;
        }
        self.counters.significant += 1;

        let served = self.tracker.get_probabilities_at(&condition, None, now);
        for p in &served {
            self.tracker.calibration_mut().track(p);
        }
        info!(
            cluster_id = %cluster.id,
            condition = %condition.key(),
            level = cluster.level,
            predictions = served.len(),
            "significant cluster"
        );
        if let Err(e) = self.predictions.save_predictions(served.clone(), now) {
            warn!(error = %e, "prediction save failed, spooling the active set");
            self.persist(PendingWrite::Predictions(self.predictions.active()));
        }

        if cluster.level >= self.config.notify.min_level {
            let message = notify::cluster_message(&cluster, self.latest_index.as_ref(), &served);
            notify::dispatch(self.notifier.clone(), message);
        }
    }

    /// Periodic work: lapse idle clusters, index snapshots, prediction
    /// refresh, calibration expiry, spool replay and state checkpoints.
    pub fn tick(&mut self, now: f64) {
        for cluster in self.clusters.flush_expired(now) {
            self.handle_cluster(cluster, now);
        }

        let recent_window = self.config.index.recent_window_secs;
        while self
            .recent_anomalies
            .front()
            .is_some_and(|a| now - a.timestamp > recent_window)
        {
            self.recent_anomalies.pop_front();
        }
        let index_due = self
            .last_index_at
            .map_or(true, |t| now - t >= self.config.index.interval_secs as f64);
        if index_due {
            let snapshot = self.index.calculate(self.recent_anomalies.make_contiguous(), now);
            debug!(index = snapshot.index, status = %snapshot.status, "index snapshot");
            self.persist(PendingWrite::Index(snapshot.clone()));
            self.latest_index = Some(snapshot);
            self.last_index_at = Some(now);
        }

        let refresh_due = self
            .last_refresh_at
            .map_or(true, |t| now - t >= self.config.patterns.refresh_interval_secs as f64);
        if refresh_due {
            let outcome = self.predictions.prune(now);
            if outcome.expired + outcome.excluded > 0 {
                info!(
                    expired = outcome.expired,
                    excluded = outcome.excluded,
                    active = outcome.remaining.len(),
                    "prediction set refreshed"
                );
            }
            self.persist(PendingWrite::Predictions(outcome.remaining));
            let resolved = self.tracker.calibration_mut().expire(now);
            if resolved > 0 {
                debug!(resolved, "predictions expired without their event");
            }
            self.tracker.compact();
            self.checkpoint();
            self.last_refresh_at = Some(now);
        }

        match self.spool.flush_if_due(&self.store, Instant::now()) {
            Ok(_) => {}
            Err(e) => self.report_corruption(&e),
        }
        self.publish_status(now);
    }

    /// Persist the learned state (pattern table, recent conditions,
    /// calibration accumulators).
    pub fn checkpoint(&mut self) {
        self.persist(PendingWrite::Patterns(self.tracker.export()));
        self.persist(PendingWrite::RecentConditions(self.tracker.recent_conditions()));
        self.persist(PendingWrite::Calibration(self.tracker.calibration().accumulators().clone()));
    }

    /// Close every open cluster, checkpoint and drain the spool once.
    pub fn shutdown(&mut self, now: f64) {
        for cluster in self.clusters.close_all() {
            self.handle_cluster(cluster, now);
        }
        self.checkpoint();
        if let Err(e) = self.spool.flush(&self.store) {
            self.report_corruption(&e);
        }
        if !self.spool.is_empty() {
            warn!(pending = self.spool.len(), "shutting down with unpersisted writes");
        }
        self.publish_status(now);
    }

    fn persist(&mut self, write: PendingWrite) {
        if let Err(e) = self.spool.write_or_spool(&self.store, write) {
            self.report_corruption(&e);
        }
    }

    fn report_corruption(&mut self, err: &StorageError) {
        if self.corrupt {
            return;
        }
        self.corrupt = true;
        error!(error = %err, "durable store corrupted, learned state is no longer persisted");
        notify::dispatch(self.notifier.clone(), notify::corruption_message(&err.to_string()));
    }

    pub fn publish_status(&self, now: f64) {
        let windows = self.detector.all_stats();
        let last_anomaly = windows
            .iter()
            .filter_map(|w| w.last_anomaly.map(|t| (w.parameter.clone(), t)))
            .collect();
        let snapshot = StatusSnapshot {
            updated_at: now,
            readings_processed: self.counters.readings,
            anomalies_detected: self.counters.anomalies,
            clusters_closed: self.counters.clusters,
            significant_clusters: self.counters.significant,
            open_clusters: self.clusters.open_count(),
            windows,
            last_anomaly,
            tracker_sample_sizes: self.tracker.sample_sizes(),
            pattern_entries: self.tracker.table().len(),
            dropped_readings: self.bus.dropped(),
            spool_depth: self.spool.len(),
            spool_dropped: self.spool.dropped(),
            store_corrupt: self.corrupt,
            active_predictions: self.predictions.len(),
            latest_index: self.latest_index.clone(),
            calibration: self.tracker.calibration().summary(),
        };
        *self.status.write() = snapshot;
    }

    /// Consume readings until the bus closes or `cancel` fires, ticking once
    /// per `tick` of wall time.
    pub async fn run(mut self, mut rx: BusReceiver, tick: Duration, cancel: CancellationToken) {
        info!("analysis stage started");
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(crate::unix_now()),
                next = rx.recv() => match next {
                    Some(reading) => {
                        self.handle_reading(reading);
                        self.publish_status(crate::unix_now());
                    }
                    None => break,
                },
            }
        }
        self.shutdown(crate::unix_now());
        info!("analysis stage stopped");
    }
}
