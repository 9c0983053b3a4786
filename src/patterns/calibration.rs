//! Brier-score calibration per event type.
//!
//! Served predictions are held as outstanding forecasts until an event of the
//! same type lands inside their lifetime (outcome 1) or they expire (outcome 0).
//! Calibration is reporting only and never alters served probabilities.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Prediction;

/// Brier score below which an event type counts as well calibrated.
pub const WELL_CALIBRATED_BRIER: f64 = 0.1;

const MAX_OUTSTANDING: usize = 10_000;

/// Running mean of squared error between stated probability and outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BrierAccumulator {
    pub outcomes: u64,
    pub sum_squared_error: f64,
}

impl BrierAccumulator {
    pub fn record(&mut self, probability: f64, happened: bool) {
        let outcome = if happened { 1.0 } else { 0.0 };
        self.outcomes += 1;
        self.sum_squared_error += (probability - outcome).powi(2);
    }

    pub fn brier(&self) -> Option<f64> {
        if self.outcomes == 0 {
            return None;
        }
        Some(self.sum_squared_error / self.outcomes as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Outstanding {
    condition: String,
    event_type: String,
    probability: f64,
    generated_at: f64,
    expires_at: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTypeCalibration {
    pub outcomes: u64,
    pub brier: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    /// Event types with at least one resolved outcome.
    pub total: usize,
    pub resolved_outcomes: u64,
    pub mean_brier: f64,
    pub well_calibrated_percent: f64,
    pub per_event_type: BTreeMap<String, EventTypeCalibration>,
}

#[derive(Debug, Clone, Default)]
pub struct CalibrationTracker {
    accumulators: BTreeMap<String, BrierAccumulator>,
    outstanding: Vec<Outstanding>,
}

impl CalibrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted accumulators.
    pub fn restore(accumulators: BTreeMap<String, BrierAccumulator>) -> Self {
        Self {
            accumulators,
            outstanding: Vec::new(),
        }
    }

    pub fn accumulators(&self) -> &BTreeMap<String, BrierAccumulator> {
        &self.accumulators
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Start tracking a served prediction. A newer prediction for the same
    /// `(condition, event_type)` replaces the outstanding one.
    pub fn track(&mut self, prediction: &Prediction) {
        self.outstanding
            .retain(|o| !(o.condition == prediction.condition && o.event_type == prediction.event_type));
        if self.outstanding.len() >= MAX_OUTSTANDING {
            self.outstanding.remove(0);
        }
        self.outstanding.push(Outstanding {
            condition: prediction.condition.clone(),
            event_type: prediction.event_type.clone(),
            probability: prediction.probability,
            generated_at: prediction.generated_at,
            expires_at: prediction.expires_at,
        });
    }

    /// Resolve outstanding forecasts of `event_type` whose lifetime covers
    /// `timestamp` as realized. Returns how many were resolved.
    pub fn resolve_event(&mut self, event_type: &str, timestamp: f64) -> usize {
        let (hit, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.outstanding)
            .into_iter()
            .partition(|o| o.event_type == event_type && o.generated_at <= timestamp && timestamp <= o.expires_at);
        self.outstanding = keep;
        for o in &hit {
            debug!(condition = %o.condition, event_type = %o.event_type, probability = o.probability, "forecast realized");
            self.record(&o.event_type, o.probability, true);
        }
        hit.len()
    }

    /// Resolve every forecast that expired before `now` as not realized.
    pub fn expire(&mut self, now: f64) -> usize {
        let (expired, keep): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.outstanding).into_iter().partition(|o| o.expires_at < now);
        self.outstanding = keep;
        for o in &expired {
            self.record(&o.event_type, o.probability, false);
        }
        expired.len()
    }

    pub fn record(&mut self, event_type: &str, probability: f64, happened: bool) {
        self.accumulators
            .entry(event_type.to_string())
            .or_default()
            .record(probability, happened);
    }

    pub fn brier(&self, event_type: &str) -> Option<f64> {
        self.accumulators.get(event_type).and_then(BrierAccumulator::brier)
    }

    pub fn summary(&self) -> CalibrationSummary {
        summarize(&self.accumulators)
    }
}

/// Summary over a set of accumulators.
pub fn summarize(accumulators: &BTreeMap<String, BrierAccumulator>) -> CalibrationSummary {
    let per_event_type: BTreeMap<String, EventTypeCalibration> = accumulators
        .iter()
        .filter_map(|(k, acc)| {
            acc.brier().map(|brier| {
                (
                    k.clone(),
                    EventTypeCalibration {
                        outcomes: acc.outcomes,
                        brier,
                    },
                )
            })
        })
        .collect();

    let total = per_event_type.len();
    let resolved_outcomes = per_event_type.values().map(|c| c.outcomes).sum();
    let (mean_brier, well_calibrated_percent) = if total == 0 {
        (0.0, 0.0)
    } else {
        let mean = per_event_type.values().map(|c| c.brier).sum::<f64>() / total as f64;
        let good = per_event_type
            .values()
            .filter(|c| c.brier < WELL_CALIBRATED_BRIER)
            .count();
        (mean, good as f64 / total as f64 * 100.0)
    };

    CalibrationSummary {
        total,
        resolved_outcomes,
        mean_brier,
        well_calibrated_percent,
        per_event_type,
    }
}
