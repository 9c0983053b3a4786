//! Live-path detection: sliding windows, per-parameter anomaly detection,
//! temporal clustering and the composite index.

pub mod anomaly;
pub mod cluster;
pub mod index;
pub mod window;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sensor::SourceKind;

pub use self::anomaly::AnomalyDetector;
pub use self::cluster::{Cluster, ClusterDetector};
pub use self::index::{IndexCalculator, IndexSnapshot, IndexStatus};
pub use self::window::SlidingWindow;

#[derive(Debug, Error, PartialEq)]
pub enum DetectError {
    #[error("insufficient history: need {needed} samples, have {have}")]
    InsufficientHistory { needed: usize, have: usize },
    #[error("zero variance in window")]
    ZeroVariance,
}

/// Severity attached to outbound notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Notification severity for a closed cluster of the given level.
    pub fn for_level(level: usize) -> Self {
        match level {
            0..=2 => Severity::Info,
            3 => Severity::Warning,
            _ => Severity::Critical,
        }
    }
}

/// A value whose z-score crossed its parameter's threshold.
///
/// Serialized field names follow the persisted anomaly record layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub timestamp: f64,
    #[serde(rename = "parameter_name")]
    pub parameter: String,
    pub value: f64,
    pub mean: f64,
    pub std: f64,
    pub z_score: f64,
    #[serde(rename = "sensor_source")]
    pub source: SourceKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anomaly_record_layout() {
        let a = AnomalyEvent {
            timestamp: 1.5,
            parameter: "btc_price".into(),
            value: 10.0,
            mean: 1.0,
            std: 2.0,
            z_score: 4.5,
            source: SourceKind::Crypto,
        };
        let json = serde_json::to_value(&a).unwrap();
        for key in ["timestamp", "parameter_name", "value", "mean", "std", "z_score", "sensor_source"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["sensor_source"], "crypto");
    }

    #[test]
    fn test_severity_for_level() {
        assert_eq!(Severity::for_level(2), Severity::Info);
        assert_eq!(Severity::for_level(3), Severity::Warning);
        assert_eq!(Severity::for_level(5), Severity::Critical);
    }
}
