//! Time-lagged correlation: for each parameter pair, find the integer shift
//! in `[-max_lag, max_lag]` that maximizes `|corr|`.
//!
//! A positive lag means the first parameter leads the second.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::stats::{pearson_shifted, summarize};
use super::{check_cancelled, AnalysisError, Frame};
use crate::config::OfflineConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagResult {
    pub param1: String,
    pub param2: String,
    pub optimal_lag_secs: f64,
    pub max_correlation: f64,
    pub samples: usize,
    pub is_causal: bool,
    pub relationship: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagReport {
    pub all_pairs: Vec<LagResult>,
    pub causal_relationships: Vec<LagResult>,
    pub total_pairs: usize,
    pub causal_count: usize,
    pub max_lag_tested: f64,
}

pub struct LagAnalyzer {
    max_lag_secs: i64,
    causal_lag_secs: i64,
    min_correlation: f64,
    min_samples: usize,
}

impl LagAnalyzer {
    pub fn new(max_lag_secs: i64, causal_lag_secs: i64, min_correlation: f64, min_samples: usize) -> Self {
        Self {
            max_lag_secs,
            causal_lag_secs,
            min_correlation,
            min_samples,
        }
    }

    pub fn from_config(config: &OfflineConfig) -> Self {
        Self::new(
            config.max_lag_secs,
            config.causal_lag_secs,
            config.min_lag_correlation,
            config.min_samples,
        )
    }

    /// Shift order 0, +1, -1, +2, -2, ... so that ties resolve to the
    /// smallest absolute lag.
    fn shifts(max_shift: i64) -> impl Iterator<Item = i64> {
        std::iter::once(0).chain((1..=max_shift).flat_map(|s| [s, -s]))
    }

    pub fn analyze_pair(
        &self,
        frame: &Frame,
        param1: &str,
        param2: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<LagResult>, AnalysisError> {
        let x = frame.column(param1)?;
        let y = frame.column(param2)?;
        let step = frame.sample_interval().unwrap_or(1.0).max(f64::EPSILON);
        let max_shift = (self.max_lag_secs as f64 / step).floor() as i64;

        let mut best: Option<(i64, f64, usize)> = None;
        for shift in Self::shifts(max_shift) {
            check_cancelled(cancel)?;
            let Some((r, n)) = pearson_shifted(x, y, shift) else {
                continue;
            };
            if n < self.min_samples {
                continue;
            }
            if best.map_or(true, |(_, b, _)| r.abs() > b.abs()) {
                best = Some((shift, r, n));
            }
        }

        let Some((shift, r, samples)) = best else {
            debug!(param1, param2, "no shift had enough overlapping samples");
            return Ok(None);
        };

        let lag = shift as f64 * step;
        let is_causal = r.abs() >= self.min_correlation && lag.abs() > self.causal_lag_secs as f64;
        Ok(Some(LagResult {
            param1: param1.to_string(),
            param2: param2.to_string(),
            optimal_lag_secs: lag,
            max_correlation: r,
            samples,
            is_causal,
            relationship: self.describe(param1, param2, lag),
        }))
    }

    fn describe(&self, param1: &str, param2: &str, lag: f64) -> String {
        if lag.abs() <= self.causal_lag_secs as f64 {
            format!("Simultaneous: {param1} and {param2} move together")
        } else if lag > 0.0 {
            format!("{param1} leads {param2} by {:.0}s", lag)
        } else {
            format!("{param2} leads {param1} by {:.0}s", -lag)
        }
    }

    /// Every pair of columns that has enough finite samples.
    pub fn analyze(&self, frame: &Frame, cancel: &CancellationToken) -> Result<LagReport, AnalysisError> {
        let names: Vec<&str> = frame
            .columns
            .iter()
            .filter(|(_, col)| summarize(col.iter().copied()).count >= self.min_samples)
            .map(|(name, _)| name.as_str())
            .collect();

        let mut all_pairs = Vec::new();
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                if let Some(result) = self.analyze_pair(frame, a, b, cancel)? {
                    all_pairs.push(result);
                }
            }
        }
        all_pairs.sort_by(|a, b| b.max_correlation.abs().total_cmp(&a.max_correlation.abs()));
        let causal_relationships: Vec<LagResult> = all_pairs.iter().filter(|r| r.is_causal).cloned().collect();

        info!(
            pairs = all_pairs.len(),
            causal = causal_relationships.len(),
            "lag analysis complete"
        );
        Ok(LagReport {
            total_pairs: all_pairs.len(),
            causal_count: causal_relationships.len(),
            all_pairs,
            causal_relationships,
            max_lag_tested: self.max_lag_secs as f64,
        })
    }
}
