//! Retrospective clustering over the stored anomaly log.
//!
//! Anomalies are graph nodes and an edge joins any two whose timestamps are
//! within `window` seconds. On a time-sorted log the connected components are
//! exactly the runs whose consecutive gaps stay within the window, so a single
//! sweep suffices.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{check_cancelled, AnalysisError};
use crate::config::OfflineConfig;
use crate::detect::AnomalyEvent;

const MIN_CLUSTER_SIZE: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetroCluster {
    pub rank: usize,
    pub score: f64,
    pub anomaly_count: usize,
    pub unique_sources: usize,
    pub sources: Vec<String>,
    pub parameters: Vec<String>,
    pub start_time: f64,
    pub end_time: f64,
    pub time_span: f64,
    pub is_multi_source: bool,
}

pub struct ClusterAnalyzer {
    window: f64,
    multi_source_threshold: usize,
}

impl ClusterAnalyzer {
    pub fn new(window: f64, multi_source_threshold: usize) -> Self {
        Self {
            window,
            multi_source_threshold,
        }
    }

    pub fn from_config(config: &OfflineConfig) -> Self {
        Self::new(config.cluster_window_secs, config.multi_source_threshold)
    }

    /// Components of at least two anomalies, ranked by distinct sources,
    /// then anomaly count, then tighter span.
    pub fn analyze(&self, anomalies: &[AnomalyEvent], cancel: &CancellationToken) -> Result<Vec<RetroCluster>, AnalysisError> {
        let mut sorted: Vec<&AnomalyEvent> = anomalies.iter().filter(|a| a.timestamp.is_finite()).collect();
        sorted.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

        let mut clusters = Vec::new();
        let mut run: Vec<&AnomalyEvent> = Vec::new();
        for (i, anomaly) in sorted.into_iter().enumerate() {
            if i % 1024 == 0 {
                check_cancelled(cancel)?;
            }
            if let Some(last) = run.last() {
                if anomaly.timestamp - last.timestamp > self.window {
                    self.push_component(&mut clusters, &run);
                    run.clear();
                }
            }
            run.push(anomaly);
        }
        self.push_component(&mut clusters, &run);

        clusters.sort_by(|a, b| {
            b.unique_sources
                .cmp(&a.unique_sources)
                .then(b.anomaly_count.cmp(&a.anomaly_count))
                .then(a.time_span.total_cmp(&b.time_span))
                .then(a.start_time.total_cmp(&b.start_time))
        });
        for (i, c) in clusters.iter_mut().enumerate() {
            c.rank = i + 1;
        }

        info!(
            clusters = clusters.len(),
            multi_source = clusters.iter().filter(|c| c.is_multi_source).count(),
            "retrospective clustering complete"
        );
        Ok(clusters)
    }

    fn push_component(&self, out: &mut Vec<RetroCluster>, run: &[&AnomalyEvent]) {
        if run.len() < MIN_CLUSTER_SIZE {
            return;
        }
        let sources: BTreeSet<String> = run.iter().map(|a| a.source.to_string()).collect();
        let parameters: BTreeSet<String> = run.iter().map(|a| format!("{}.{}", a.source, a.parameter)).collect();
        let start_time = run[0].timestamp;
        let end_time = run[run.len() - 1].timestamp;
        let time_span = end_time - start_time;
        let unique_sources = sources.len();
        out.push(RetroCluster {
            rank: 0,
            score: unique_sources as f64 * run.len() as f64 / (1.0 + time_span),
            anomaly_count: run.len(),
            unique_sources,
            sources: sources.into_iter().collect(),
            parameters: parameters.into_iter().collect(),
            start_time,
            end_time,
            time_span,
            is_multi_source: unique_sources >= self.multi_source_threshold,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SourceKind;

    fn anomaly(t: f64, source: SourceKind) -> AnomalyEvent {
        AnomalyEvent {
            timestamp: t,
            parameter: "value".into(),
            value: 10.0,
            mean: 0.0,
            std: 1.0,
            z_score: 10.0,
            source,
        }
    }

    #[test]
    fn test_components_and_ranking() {
        use SourceKind::*;
        let log = vec![
            anomaly(0.0, Crypto),
            anomaly(1.0, Network),
            anomaly(2.0, System),
            anomaly(100.0, Crypto),
            anomaly(101.0, Network),
            anomaly(102.0, System),
            anomaly(103.0, News),
            anomaly(200.0, Crypto),
        ];
        let clusters = ClusterAnalyzer::new(3.0, 3).analyze(&log, &CancellationToken::new()).unwrap();
        assert_eq!(clusters.len(), 2);

        assert_eq!(clusters[0].rank, 1);
        assert_eq!(clusters[0].anomaly_count, 4);
        assert_eq!(clusters[0].unique_sources, 4);
        assert_eq!(clusters[0].start_time, 100.0);
        assert_eq!(clusters[0].time_span, 3.0);

        assert_eq!(clusters[1].rank, 2);
        assert_eq!(clusters[1].sources, vec!["crypto", "network", "system"]);
        assert!(clusters.iter().all(|c| c.is_multi_source));
    }

    #[test]
    fn test_chain_links_through_intermediate() {
        use SourceKind::*;
        let log = vec![anomaly(0.0, Crypto), anomaly(2.5, Network), anomaly(5.0, Crypto)];
        let clusters = ClusterAnalyzer::new(3.0, 3).analyze(&log, &CancellationToken::new()).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].anomaly_count, 3);
        assert!(!clusters[0].is_multi_source);
    }

    #[test]
    fn test_empty_and_singletons() {
        let analyzer = ClusterAnalyzer::new(3.0, 3);
        assert!(analyzer.analyze(&[], &CancellationToken::new()).unwrap().is_empty());
        let lone = vec![anomaly(0.0, SourceKind::Crypto), anomaly(50.0, SourceKind::News)];
        assert!(analyzer.analyze(&lone, &CancellationToken::new()).unwrap().is_empty());
    }
}
