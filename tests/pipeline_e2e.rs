//! End-to-end scenarios across detection, clustering, pattern serving and
//! persistence.

use std::sync::Arc;

use matrixwatch::config::{ClusterConfig, Config, DetectorConfig, PatternConfig};
use matrixwatch::detect::{AnomalyDetector, AnomalyEvent, ClusterDetector};
use matrixwatch::notify::LogNotifier;
use matrixwatch::patterns::{Condition, EventCategory, PatternEntry, PatternTracker, Prediction, PredictionStore};
use matrixwatch::pipeline::{ReadingBus, SharedStatus, Stage};
use matrixwatch::sensor::{Reading, SourceKind};
use matrixwatch::storage::Store;

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
fn test_single_spike_after_flat_window() {
    let mut detector = AnomalyDetector::new(DetectorConfig::default());
    for i in 0..100 {
        let r = Reading::new(i as f64, SourceKind::Network).with("latency_ms", 1.0);
        assert!(detector.process(&r).is_empty());
    }
    let events = detector.process(&Reading::new(100.0, SourceKind::Network).with("latency_ms", 100.0));
    assert_eq!(events.len(), 1);

    // The spike is scored against the window it just entered: 99 ones and
    // the spike itself.
    let values: Vec<f64> = std::iter::repeat(1.0).take(99).chain([100.0]).collect();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
    let expected = (100.0 - mean) / std;

    let e = &events[0];
    assert_eq!(e.parameter, "latency_ms");
    assert_eq!(e.source, SourceKind::Network);
    assert!((e.z_score - expected).abs() < 1e-9);
    assert!(e.z_score > 4.0);
}

#[test]
fn test_three_sources_form_one_significant_cluster() {
    let mut clusters = ClusterDetector::new(&ClusterConfig::default());
    assert!(clusters.add(anomaly(0.0, SourceKind::Crypto)).is_empty());
    assert!(clusters.add(anomaly(5.0, SourceKind::News)).is_empty());
    assert!(clusters.add(anomaly(10.0, SourceKind::QuantumRng)).is_empty());

    let closed = clusters.flush_expired(100.0);
    assert_eq!(closed.len(), 1);
    let c = &closed[0];
    assert_eq!(c.level, 3);
    assert_eq!(c.level, c.distinct_sources.len());
    assert!(c.significant);
}

#[test]
fn test_anomalies_beyond_window_never_share_a_cluster() {
    let mut clusters = ClusterDetector::new(&ClusterConfig::default());
    assert!(clusters.add(anomaly(0.0, SourceKind::Crypto)).is_empty());
    // The lone crypto anomaly lapses without forming a cluster.
    assert!(clusters.add(anomaly(31.0, SourceKind::News)).is_empty());
    assert!(clusters.close_all().is_empty());

    let mut clusters = ClusterDetector::new(&ClusterConfig::default());
    clusters.add(anomaly(0.0, SourceKind::Crypto));
    clusters.add(anomaly(1.0, SourceKind::Crypto));
    let first = clusters.add(anomaly(40.0, SourceKind::Crypto));
    clusters.add(anomaly(41.0, SourceKind::Crypto));
    let second = clusters.close_all();

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    let times = |c: &matrixwatch::detect::Cluster| c.anomalies.iter().map(|a| a.timestamp).collect::<Vec<_>>();
    assert_eq!(times(&first[0]), vec![0.0, 1.0]);
    assert_eq!(times(&second[0]), vec![40.0, 41.0]);
    assert_eq!(first[0].level, 1);
}

fn seeded_tracker(config: PatternConfig) -> PatternTracker {
    let mut tracker = PatternTracker::new(config, [("btc_pump_4h".to_string(), EventCategory::Crypto)]);
    let mut entry = PatternEntry::new("L3_crypto_news_quantum_rng", "btc_pump_4h", EventCategory::Crypto);
    entry.observations = 100;
    for _ in 0..21 {
        entry.record_occurrence(2.0 * 3600.0);
    }
    entry.record_occurrence(6.0 * 3600.0);
    entry.occurrences = 21;
    tracker.restore(vec![entry], Vec::new(), 0.0);
    tracker
}

#[test]
fn test_pattern_probability_and_category_denylist() {
    let condition = Condition::new(
        3,
        [SourceKind::Crypto, SourceKind::News, SourceKind::QuantumRng],
        1_704_549_600.0,
    );

    let served = seeded_tracker(PatternConfig::default()).get_probabilities_at(&condition, None, condition.timestamp);
    assert_eq!(served.len(), 1);
    assert!((served[0].probability - 0.21).abs() < 1e-12);
    assert_eq!(served[0].sample_size, 100);
    assert!((served[0].min_time_h - 2.0).abs() < 1e-9);

    let denied = PatternConfig {
        denylisted_categories: vec!["crypto".into()],
        ..PatternConfig::default()
    };
    assert!(seeded_tracker(denied)
        .get_probabilities_at(&condition, None, condition.timestamp)
        .is_empty());
}

#[test]
fn test_refresh_leaves_no_expired_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("mw.db")).unwrap();
    let predictions = PredictionStore::open(store.clone(), PatternConfig::default());

    let make = |event_type: &str, expires_at: f64| Prediction {
        condition: "L3_crypto_news_system".into(),
        event_type: event_type.into(),
        category: EventCategory::Crypto,
        probability: 0.4,
        sample_size: 20,
        min_time_h: 1.0,
        max_time_h: 3.0,
        generated_at: 0.0,
        expires_at,
        temporal: false,
        region: None,
    };
    predictions
        .save_predictions(vec![make("btc_pump_1h", 50.0), make("btc_dump_1h", 500.0)], 0.0)
        .unwrap();

    let outcome = predictions.refresh(100.0).unwrap();
    assert_eq!(outcome.expired, 1);
    let persisted = store.load_predictions().unwrap();
    assert_eq!(persisted.len(), 1);
    assert!(persisted.iter().all(|p| p.expires_at >= 100.0));
}

#[tokio::test]
async fn test_learned_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mw.db");
    let config = Config::default();

    let build = |store: Store| {
        let predictions = Arc::new(PredictionStore::open(store.clone(), config.patterns.clone()));
        Stage::new(
            config.clone(),
            store,
            predictions,
            Arc::new(LogNotifier),
            ReadingBus::new(16),
            SharedStatus::default(),
            0.0,
        )
    };

    {
        let mut stage = build(Store::open(&path).unwrap());
        for (k, source) in [SourceKind::Crypto, SourceKind::News, SourceKind::QuantumRng]
            .into_iter()
            .enumerate()
        {
            for i in 0..30 {
                let v = if i % 2 == 0 { 1.0 } else { -1.0 };
                stage.handle_reading(Reading::new(k as f64 + i as f64 * 0.01, source).with("value", v));
            }
        }
        stage.handle_reading(Reading::new(10.0, SourceKind::Crypto).with("value", 50.0));
        stage.handle_reading(Reading::new(11.0, SourceKind::News).with("value", 50.0));
        stage.handle_reading(Reading::new(12.0, SourceKind::QuantumRng).with("value", 50.0));
        stage.shutdown(20.0);
    }

    let store = Store::open(&path).unwrap();
    assert_eq!(store.count_clusters(3).unwrap(), 1);
    let restored = build(store);
    assert!(restored
        .tracker()
        .sample_sizes()
        .contains_key("L3_crypto_news_quantum_rng"));
}
