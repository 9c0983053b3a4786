use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::DetectorConfig;
use crate::detect::window::SlidingWindow;
use crate::detect::{AnomalyEvent, DetectError};
use crate::sensor::{Reading, SourceKind};

/// Identity of one tracked parameter: a numeric field of one source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterKey {
    pub source: SourceKind,
    pub field: String,
}

impl std::fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.source, self.field)
    }
}

struct ParameterState {
    window: SlidingWindow,
    threshold: f64,
    last_anomaly: Option<f64>,
}

/// Occupancy and statistics of one parameter window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub parameter: String,
    pub count: usize,
    pub capacity: usize,
    pub mean: f64,
    pub std: f64,
    pub threshold: f64,
    pub last_anomaly: Option<f64>,
}

/// Streaming z-score detector with one window per parameter.
pub struct AnomalyDetector {
    config: DetectorConfig,
    params: HashMap<ParameterKey, ParameterState>,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            params: HashMap::new(),
        }
    }

    /// Feed one reading. Each numeric field updates its own window first, then
    /// the new value is scored against the updated window.
    pub fn process(&mut self, reading: &Reading) -> Vec<AnomalyEvent> {
        let mut events = Vec::new();
        for (field, value) in reading.numeric_fields() {
            if let Some(event) = self.observe(reading.timestamp, reading.source, field, value) {
                events.push(event);
            }
        }
        events
    }

    fn observe(
        &mut self,
        timestamp: f64,
        source: SourceKind,
        field: &str,
        value: f64,
    ) -> Option<AnomalyEvent> {
        let key = ParameterKey {
            source,
            field: field.to_string(),
        };
        let config = &self.config;
        let min_history = config.min_history;
        let state = self.params.entry(key.clone()).or_insert_with(|| {
            let (size, threshold) = config.resolve(source.as_str(), field);
            ParameterState {
                window: SlidingWindow::new(size),
                threshold,
                last_anomaly: None,
            }
        });

        state.window.push(value);

        let z = match state.window.z_score(value, min_history) {
            Ok(z) => z,
            Err(DetectError::InsufficientHistory { .. }) => return None,
            Err(DetectError::ZeroVariance) => {
                debug!(parameter = %key, timestamp, "zero variance, skipping");
                return None;
            }
        };

        if z.abs() <= state.threshold {
            return None;
        }

        state.last_anomaly = Some(timestamp);
        let event = AnomalyEvent {
            timestamp,
            parameter: key.field.clone(),
            value,
            mean: state.window.mean(),
            std: state.window.std_dev(),
            z_score: z,
            source,
        };
        warn!(
            parameter = %key,
            value,
            mean = event.mean,
            z_score = z,
            timestamp,
            "anomaly detected"
        );
        Some(event)
    }

    pub fn stats(&self, source: SourceKind, field: &str) -> Option<WindowStats> {
        let key = ParameterKey {
            source,
            field: field.to_string(),
        };
        self.params.get(&key).map(|s| Self::stats_of(&key, s))
    }

    /// Snapshot of every tracked parameter, sorted by name.
    pub fn all_stats(&self) -> Vec<WindowStats> {
        let mut keys: Vec<&ParameterKey> = self.params.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|k| Self::stats_of(k, &self.params[k]))
            .collect()
    }

    fn stats_of(key: &ParameterKey, s: &ParameterState) -> WindowStats {
        WindowStats {
            parameter: key.to_string(),
            count: s.window.len(),
            capacity: s.window.capacity(),
            mean: s.window.mean(),
            std: s.window.std_dev(),
            threshold: s.threshold,
            last_anomaly: s.last_anomaly,
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    /// Drop every window (test and operator reset).
    pub fn clear(&mut self) {
        self.params.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterOverride;

    fn reading(t: f64, source: SourceKind, field: &str, v: f64) -> Reading {
        Reading::new(t, source).with(field, v)
    }

    #[test]
    fn test_flat_window_then_spike_emits_exactly_one_anomaly() {
        let mut det = AnomalyDetector::new(DetectorConfig::default());
        for i in 0..100 {
            let out = det.process(&reading(i as f64, SourceKind::Network, "p", 1.0));
            assert!(out.is_empty());
        }
        let out = det.process(&reading(100.0, SourceKind::Network, "p", 100.0));
        assert_eq!(out.len(), 1);

        // Window now holds 99 ones and the spike.
        let mean = (99.0 + 100.0) / 100.0;
        let var = (99.0 * (1.0f64 - mean).powi(2) + (100.0f64 - mean).powi(2)) / 99.0;
        let expected_z = (100.0 - mean) / var.sqrt();

        let a = &out[0];
        assert_eq!(a.parameter, "p");
        assert_eq!(a.source, SourceKind::Network);
        assert!((a.mean - mean).abs() < 1e-9);
        assert!((a.z_score - expected_z).abs() < 1e-9);
        assert!(a.z_score > 4.0);
    }

    #[test]
    fn test_threshold_boundary() {
        let mut det = AnomalyDetector::new(DetectorConfig::default());
        for i in 0..50 {
            det.process(&reading(i as f64, SourceKind::System, "cpu", 100.0 + (i % 2) as f64 * 0.1));
        }
        let out = det.process(&reading(50.0, SourceKind::System, "cpu", 100.06));
        assert!(out.is_empty());
        let out = det.process(&reading(51.0, SourceKind::System, "cpu", 200.0));
        assert_eq!(out.len(), 1);
        assert!(out[0].z_score.abs() > 4.0);
    }

    #[test]
    fn test_insufficient_history_suppresses() {
        let mut det = AnomalyDetector::new(DetectorConfig::default());
        for i in 0..8 {
            det.process(&reading(i as f64, SourceKind::News, "count", (i % 2) as f64));
        }
        // Ninth value: window of 9 < min_history of 10.
        assert!(det.process(&reading(9.0, SourceKind::News, "count", 1e9)).is_empty());
    }

    #[test]
    fn test_parameters_are_independent_and_overridable() {
        let mut cfg = DetectorConfig::default();
        cfg.overrides.insert(
            "weather.temp".into(),
            ParameterOverride {
                window_size: Some(20),
                z_threshold: Some(2.0),
            },
        );
        let mut det = AnomalyDetector::new(cfg);
        for i in 0..30 {
            det.process(&reading(i as f64, SourceKind::Weather, "temp", 10.0));
            det.process(&reading(i as f64, SourceKind::Weather, "wind", 5.0));
        }
        let temp = det.stats(SourceKind::Weather, "temp").unwrap();
        let wind = det.stats(SourceKind::Weather, "wind").unwrap();
        assert_eq!(temp.capacity, 20);
        assert_eq!(temp.count, 20);
        assert_eq!(temp.threshold, 2.0);
        assert_eq!(wind.capacity, 100);
        assert_eq!(wind.count, 30);
        assert_eq!(det.parameter_count(), 2);

        det.clear();
        assert_eq!(det.parameter_count(), 0);
    }

    #[test]
    fn test_last_anomaly_recorded() {
        let mut det = AnomalyDetector::new(DetectorConfig::default());
        for i in 0..30 {
            det.process(&reading(i as f64, SourceKind::Crypto, "price", 100.0 + (i % 3) as f64));
        }
        det.process(&reading(31.0, SourceKind::Crypto, "price", 1000.0));
        let stats = det.all_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].parameter, "crypto.price");
        assert_eq!(stats[0].last_anomaly, Some(31.0));
    }
}
