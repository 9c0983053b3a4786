//! Live temporal clustering of anomalies across sources.
//!
//! Uses `cluster.live_window_secs`. The retrospective analyzer in
//! `analysis::cluster` has its own, finer window.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::detect::AnomalyEvent;
use crate::sensor::SourceKind;

/// A closed, immutable group of temporally proximate anomalies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub anomalies: Vec<AnomalyEvent>,
    #[serde(rename = "sensors_involved")]
    pub distinct_sources: BTreeSet<SourceKind>,
    pub level: usize,
    pub start_time: f64,
    pub end_time: f64,
    /// Level at or above the surfacing floor.
    #[serde(default)]
    pub significant: bool,
}

impl Cluster {
    pub fn source_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.distinct_sources.iter().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

struct OpenCluster {
    id: Uuid,
    seq: u64,
    anomalies: Vec<AnomalyEvent>,
    sources: BTreeSet<SourceKind>,
    start: f64,
    last: f64,
}

impl OpenCluster {
    fn close(self, min_significant_level: usize) -> Cluster {
        let level = self.sources.len();
        Cluster {
            id: self.id,
            anomalies: self.anomalies,
            distinct_sources: self.sources,
            level,
            start_time: self.start,
            end_time: self.last,
            significant: level >= min_significant_level,
        }
    }
}

/// Buffers open clusters and emits them once their window lapses.
pub struct ClusterDetector {
    window: f64,
    min_significant_level: usize,
    open: Vec<OpenCluster>,
    next_seq: u64,
    watermark: f64,
}

impl ClusterDetector {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            window: config.live_window_secs,
            min_significant_level: config.min_significant_level,
            open: Vec::new(),
            next_seq: 0,
            watermark: f64::NEG_INFINITY,
        }
    }

    pub fn window_secs(&self) -> f64 {
        self.window
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Add an anomaly and return every cluster its arrival closed.
    ///
    /// The anomaly joins the open cluster whose latest member is nearest in
    /// time, provided it is within the window. Equidistant candidates resolve
    /// to the earlier-opened cluster. Same-source repeats join like any other
    /// member but do not raise the level.
    pub fn add(&mut self, anomaly: AnomalyEvent) -> Vec<Cluster> {
        let t = anomaly.timestamp;
        if t > self.watermark {
            self.watermark = t;
        }
        let watermark = self.watermark;
        let closed = self.close_where(move |c, w| watermark - c.last > w);

        let best = self
            .open
            .iter()
            .enumerate()
            .map(|(i, c)| (i, (t - c.last).abs(), c.seq))
            .filter(|(_, d, _)| *d <= self.window)
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.2.cmp(&b.2)))
            .map(|(i, _, _)| i);

        match best {
            Some(i) => {
                let c = &mut self.open[i];
                c.sources.insert(anomaly.source);
                c.start = c.start.min(t);
                c.last = c.last.max(t);
                c.anomalies.push(anomaly);
                debug!(cluster_id = %c.id, members = c.anomalies.len(), "anomaly joined open cluster");
            }
            None => {
                let mut sources = BTreeSet::new();
                sources.insert(anomaly.source);
                let id = Uuid::new_v4();
                debug!(cluster_id = %id, timestamp = t, "opened cluster");
                self.open.push(OpenCluster {
                    id,
                    seq: self.next_seq,
                    anomalies: vec![anomaly],
                    sources,
                    start: t,
                    last: t,
                });
                self.next_seq += 1;
            }
        }

        closed
    }

    /// Close clusters whose latest member is older than `now - window`.
    pub fn flush_expired(&mut self, now: f64) -> Vec<Cluster> {
        self.close_where(|c, w| now - c.last > w)
    }

    /// Close everything (shutdown).
    pub fn close_all(&mut self) -> Vec<Cluster> {
        self.close_where(|_, _| true)
    }

    fn close_where(&mut self, expired: impl Fn(&OpenCluster, f64) -> bool) -> Vec<Cluster> {
        let window = self.window;
        let (done, keep): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.open).into_iter().partition(|c| expired(c, window));
        self.open = keep;

        let mut closed = Vec::new();
        for c in done {
            if c.anomalies.len() < 2 {
                debug!(cluster_id = %c.id, "lone anomaly, no cluster formed");
                continue;
            }
            let cluster = c.close(self.min_significant_level);
            info!(
                cluster_id = %cluster.id,
                level = cluster.level,
                anomalies = cluster.anomalies.len(),
                sources = ?cluster.source_names(),
                significant = cluster.significant,
                "cluster closed"
            );
            closed.push(cluster);
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anomaly(t: f64, source: SourceKind) -> AnomalyEvent {
        AnomalyEvent {
            timestamp: t,
            parameter: "x".into(),
            value: 10.0,
            mean: 0.0,
            std: 1.0,
            z_score: 10.0,
            source,
        }
    }

    fn detector(window: f64) -> ClusterDetector {
        ClusterDetector::new(&ClusterConfig {
            live_window_secs: window,
            min_significant_level: 3,
        })
    }

    #[test]
    fn test_three_sources_form_one_significant_cluster() {
        let mut det = detector(30.0);
        assert!(det.add(anomaly(0.0, SourceKind::Crypto)).is_empty());
        assert!(det.add(anomaly(5.0, SourceKind::QuantumRng)).is_empty());
        assert!(det.add(anomaly(10.0, SourceKind::Earthquake)).is_empty());
        assert_eq!(det.open_count(), 1);

        let closed = det.flush_expired(41.0);
        assert_eq!(closed.len(), 1);
        let c = &closed[0];
        assert_eq!(c.level, 3);
        assert_eq!(c.level, c.distinct_sources.len());
        assert!(c.significant);
        assert_eq!(c.start_time, 0.0);
        assert_eq!(c.end_time, 10.0);
        assert_eq!(c.anomalies.len(), 3);
    }

    #[test]
    fn test_pairs_inside_window_share_cluster_outside_do_not() {
        let mut det = detector(30.0);
        det.add(anomaly(100.0, SourceKind::News));
        det.add(anomaly(130.0, SourceKind::Weather));
        let closed = det.close_all();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].level, 2);
        assert!(!closed[0].significant);

        let mut det = detector(30.0);
        det.add(anomaly(100.0, SourceKind::News));
        det.add(anomaly(130.5, SourceKind::Weather));
        assert!(det.close_all().is_empty(), "two lone anomalies form no cluster");
    }

    #[test]
    fn test_new_arrival_closes_lapsed_cluster() {
        let mut det = detector(30.0);
        det.add(anomaly(0.0, SourceKind::Crypto));
        det.add(anomaly(1.0, SourceKind::Crypto));
        let closed = det.add(anomaly(100.0, SourceKind::News));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].level, 1, "same-source repeats do not raise level");
        assert_eq!(closed[0].anomalies.len(), 2);
        assert_eq!(det.open_count(), 1);
    }

    #[test]
    fn test_equidistant_anomaly_joins_earlier_opened_cluster() {
        let mut det = detector(10.0);
        // Cluster A opened at t=0, a later-opened cluster B sits at t=10.
        det.add(anomaly(0.0, SourceKind::Crypto));
        det.open.push(OpenCluster {
            id: Uuid::new_v4(),
            seq: 99,
            anomalies: vec![anomaly(10.0, SourceKind::News)],
            sources: [SourceKind::News].into_iter().collect(),
            start: 10.0,
            last: 10.0,
        });
        // t=5 is 5s from both clusters' latest members.
        det.add(anomaly(5.0, SourceKind::Weather));
        let closed = det.close_all();
        let first = closed.iter().find(|c| c.start_time == 0.0).unwrap();
        assert_eq!(first.anomalies.len(), 2);
        assert!(first.distinct_sources.contains(&SourceKind::Weather));
    }

    #[test]
    fn test_cluster_record_layout() {
        let mut det = detector(30.0);
        det.add(anomaly(0.0, SourceKind::Crypto));
        det.add(anomaly(1.0, SourceKind::News));
        let c = det.close_all().remove(0);
        let json = serde_json::to_value(&c).unwrap();
        for key in ["id", "anomalies", "sensors_involved", "level", "start_time", "end_time"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["sensors_involved"], serde_json::json!(["crypto", "news"]));
    }
}
