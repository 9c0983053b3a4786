//! Composite anomaly index: a weighted 0-100 score over recent anomalies,
//! contextualised by a trailing baseline.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::IndexConfig;
use crate::detect::AnomalyEvent;
use crate::sensor::SourceKind;

/// Mean `|z|` at which a source's magnitude saturates.
const Z_SATURATION: f64 = 10.0;
/// Anomaly count at which a source's magnitude saturates.
const COUNT_SATURATION: f64 = 10.0;
const Z_SHARE: f64 = 0.7;
const COUNT_SHARE: f64 = 0.3;

/// Points a source contributes at full magnitude.
pub fn default_weight(source: SourceKind) -> f64 {
    match source {
        SourceKind::QuantumRng => 25.0,
        SourceKind::Earthquake => 20.0,
        SourceKind::SpaceWeather => 15.0,
        SourceKind::Blockchain => 12.0,
        SourceKind::Crypto => 10.0,
        SourceKind::News => 8.0,
        SourceKind::Weather => 8.0,
        SourceKind::System => 5.0,
        SourceKind::Network => 5.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Normal,
    Elevated,
    High,
    Critical,
}

impl IndexStatus {
    pub fn from_index(index: f64) -> Self {
        if index < 25.0 {
            IndexStatus::Normal
        } else if index < 50.0 {
            IndexStatus::Elevated
        } else if index < 75.0 {
            IndexStatus::High
        } else {
            IndexStatus::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Normal => "normal",
            IndexStatus::Elevated => "elevated",
            IndexStatus::High => "high",
            IndexStatus::Critical => "critical",
        }
    }
}

impl std::fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub timestamp: f64,
    pub index: f64,
    /// Points contributed per source.
    pub breakdown: BTreeMap<String, f64>,
    pub baseline_ratio: f64,
    pub status: IndexStatus,
}

/// Bounded, monotonic magnitude of one source's recent activity.
pub fn magnitude(mean_abs_z: f64, count: usize) -> f64 {
    let z_part = (mean_abs_z / Z_SATURATION).clamp(0.0, 1.0);
    let count_part = (count as f64 / COUNT_SATURATION).clamp(0.0, 1.0);
    Z_SHARE * z_part + COUNT_SHARE * count_part
}

pub struct IndexCalculator {
    weights: HashMap<SourceKind, f64>,
    lookback_secs: f64,
    history: VecDeque<(f64, f64)>,
}

impl IndexCalculator {
    pub fn new(config: &IndexConfig) -> Self {
        let mut weights: HashMap<SourceKind, f64> =
            SourceKind::ALL.iter().map(|s| (*s, default_weight(*s))).collect();
        for (name, w) in &config.weights {
            match name.parse::<SourceKind>() {
                Ok(source) => {
                    weights.insert(source, *w);
                }
                Err(_) => warn!(source = %name, "index weight for unknown source ignored"),
            }
        }
        Self {
            weights,
            lookback_secs: config.baseline_lookback_hours * 3600.0,
            history: VecDeque::new(),
        }
    }

    pub fn weight(&self, source: SourceKind) -> f64 {
        self.weights.get(&source).copied().unwrap_or(0.0)
    }

    /// Score the given anomalies at `now` and fold the result into the
    /// baseline accumulator.
    pub fn calculate(&mut self, recent: &[AnomalyEvent], now: f64) -> IndexSnapshot {
        let mut per_source: BTreeMap<SourceKind, (f64, usize)> = BTreeMap::new();
        for a in recent {
            let entry = per_source.entry(a.source).or_insert((0.0, 0));
            entry.0 += a.z_score.abs();
            entry.1 += 1;
        }

        let mut breakdown = BTreeMap::new();
        let mut total = 0.0;
        for (source, (sum_z, count)) in per_source {
            let contribution = self.weight(source) * magnitude(sum_z / count as f64, count);
            total += contribution;
            breakdown.insert(source.to_string(), contribution);
        }
        let index = total.clamp(0.0, 100.0);

        let cutoff = now - self.lookback_secs;
        while self.history.front().is_some_and(|(t, _)| *t < cutoff) {
            self.history.pop_front();
        }
        let baseline = if self.history.is_empty() {
            0.0
        } else {
            self.history.iter().map(|(_, v)| v).sum::<f64>() / self.history.len() as f64
        };
        let baseline_ratio = if baseline > 0.0 { index / baseline } else { 1.0 };
        self.history.push_back((now, index));

        let status = IndexStatus::from_index(index);
        debug!(index, baseline, baseline_ratio, status = %status, "index calculated");
        IndexSnapshot {
            timestamp: now,
            index,
            breakdown,
            baseline_ratio,
            status,
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}
