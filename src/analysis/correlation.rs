use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::stats::{pearson, summarize};
use super::{check_cancelled, AnalysisError, Frame};
use crate::config::OfflineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Positive,
    Negative,
}

/// Symmetric Pearson matrix over the eligible columns of a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub names: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl CorrelationMatrix {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.names.iter().position(|n| n == a)?;
        let j = self.names.iter().position(|n| n == b)?;
        Some(self.values[i][j])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedPair {
    pub param1: String,
    pub param2: String,
    pub correlation: f64,
    pub abs_correlation: f64,
    pub direction: Direction,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationReport {
    pub matrix: CorrelationMatrix,
    pub significant_pairs: Vec<CorrelatedPair>,
    pub total_parameters: usize,
    pub significant_count: usize,
}

/// Pairwise linear correlation across every numeric parameter.
pub struct CorrelationAnalyzer {
    threshold: f64,
    min_samples: usize,
}

impl CorrelationAnalyzer {
    pub fn new(threshold: f64, min_samples: usize) -> Self {
        Self {
            threshold,
            min_samples,
        }
    }

    pub fn from_config(config: &OfflineConfig) -> Self {
        Self::new(config.correlation_threshold, config.min_samples)
    }

    /// Columns with at least `min_samples` finite, non-constant values take
    /// part. Pairs without enough overlap correlate as 0.
    pub fn compute_matrix(&self, frame: &Frame, cancel: &CancellationToken) -> Result<CorrelationMatrix, AnalysisError> {
        let eligible: Vec<(&String, &Vec<f64>)> = frame
            .columns
            .iter()
            .filter(|(name, col)| {
                let s = summarize(col.iter().copied());
                let ok = s.count >= self.min_samples && !s.is_degenerate();
                if !ok {
                    debug!(parameter = %name, samples = s.count, "column excluded from correlation");
                }
                ok
            })
            .collect();

        if eligible.len() < 2 {
            return Ok(CorrelationMatrix::default());
        }

        let n = eligible.len();
        let mut values = vec![vec![0.0; n]; n];
        for i in 0..n {
            check_cancelled(cancel)?;
            values[i][i] = 1.0;
            for j in (i + 1)..n {
                let r = match pearson(eligible[i].1, eligible[j].1) {
                    Some((r, samples)) if samples >= self.min_samples => r,
                    _ => 0.0,
                };
                values[i][j] = r;
                values[j][i] = r;
            }
        }

        Ok(CorrelationMatrix {
            names: eligible.iter().map(|(n, _)| (*n).clone()).collect(),
            values,
        })
    }

    /// Pairs with `|r|` above the threshold, strongest first.
    pub fn significant_pairs(&self, frame: &Frame, matrix: &CorrelationMatrix) -> Vec<CorrelatedPair> {
        let mut pairs = Vec::new();
        for i in 0..matrix.names.len() {
            for j in (i + 1)..matrix.names.len() {
                let r = matrix.values[i][j];
                if r.abs() <= self.threshold {
                    continue;
                }
                let samples = match (frame.columns.get(&matrix.names[i]), frame.columns.get(&matrix.names[j])) {
                    (Some(a), Some(b)) => pearson(a, b).map_or(0, |(_, n)| n),
                    _ => 0,
                };
                pairs.push(CorrelatedPair {
                    param1: matrix.names[i].clone(),
                    param2: matrix.names[j].clone(),
                    correlation: r,
                    abs_correlation: r.abs(),
                    direction: if r >= 0.0 { Direction::Positive } else { Direction::Negative },
                    samples,
                });
            }
        }
        pairs.sort_by(|a, b| b.abs_correlation.total_cmp(&a.abs_correlation));
        pairs
    }

    pub fn analyze(&self, frame: &Frame, cancel: &CancellationToken) -> Result<CorrelationReport, AnalysisError> {
        let matrix = self.compute_matrix(frame, cancel)?;
        let significant_pairs = self.significant_pairs(frame, &matrix);
        info!(
            parameters = matrix.names.len(),
            significant = significant_pairs.len(),
            "correlation analysis complete"
        );
        Ok(CorrelationReport {
            total_parameters: matrix.names.len(),
            significant_count: significant_pairs.len(),
            matrix,
            significant_pairs,
        })
    }
}
