//! Offline correlation family: batch analyzers over stored history.
//!
//! Every analyzer is a synchronous function over an immutable [`Frame`] or
//! anomaly log, checks a [`CancellationToken`] between chunks of work, and
//! never touches live-path state.

pub mod advanced;
pub mod cluster;
pub mod correlation;
pub mod lag;
pub mod precursor;
pub mod runner;
pub mod stats;

use std::collections::BTreeMap;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::sensor::Reading;

#[derive(Debug, Error, PartialEq)]
pub enum AnalysisError {
    #[error("analysis cancelled")]
    Cancelled,
    #[error("insufficient samples: need {needed}, have {have}")]
    InsufficientSamples { needed: usize, have: usize },
    #[error("parameter '{0}' not present in frame")]
    MissingParameter(String),
    #[error("empty series")]
    EmptySeries,
}

/// Bail out with [`AnalysisError::Cancelled`] once the token fires.
pub fn check_cancelled(cancel: &CancellationToken) -> Result<(), AnalysisError> {
    if cancel.is_cancelled() {
        Err(AnalysisError::Cancelled)
    } else {
        Ok(())
    }
}

/// A resampled parameter matrix: one row per time bucket, one column per
/// `source.field`. Missing values are NaN.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub timestamps: Vec<f64>,
    pub columns: BTreeMap<String, Vec<f64>>,
}

impl Frame {
    pub fn new(timestamps: Vec<f64>) -> Self {
        Self {
            timestamps,
            columns: BTreeMap::new(),
        }
    }

    /// Builder-style column insertion; the column must match the row count.
    pub fn with_column(mut self, name: &str, values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), self.timestamps.len());
        self.columns.insert(name.to_string(), values);
        self
    }

    /// Bucket readings at `bucket_secs` resolution, averaging values that
    /// share a bucket.
    pub fn from_readings(readings: &[Reading], bucket_secs: f64) -> Self {
        let bucket_of = |t: f64| (t / bucket_secs).floor() as i64;

        let mut buckets: Vec<i64> = readings.iter().map(|r| bucket_of(r.timestamp)).collect();
        buckets.sort_unstable();
        buckets.dedup();
        let row_of: BTreeMap<i64, usize> = buckets.iter().enumerate().map(|(i, b)| (*b, i)).collect();

        let rows = buckets.len();
        let mut sums: BTreeMap<String, (Vec<f64>, Vec<u32>)> = BTreeMap::new();
        for r in readings {
            let row = row_of[&bucket_of(r.timestamp)];
            for (field, value) in r.numeric_fields() {
                let (sum, count) = sums
                    .entry(format!("{}.{}", r.source, field))
                    .or_insert_with(|| (vec![0.0; rows], vec![0; rows]));
                sum[row] += value;
                count[row] += 1;
            }
        }

        let columns = sums
            .into_iter()
            .map(|(name, (sum, count))| {
                let values = sum
                    .iter()
                    .zip(&count)
                    .map(|(s, c)| if *c == 0 { f64::NAN } else { s / *c as f64 })
                    .collect();
                (name, values)
            })
            .collect();

        Self {
            timestamps: buckets.iter().map(|b| *b as f64 * bucket_secs).collect(),
            columns,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn column(&self, name: &str) -> Result<&[f64], AnalysisError> {
        self.columns
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| AnalysisError::MissingParameter(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    /// Median spacing between rows, in seconds.
    pub fn sample_interval(&self) -> Option<f64> {
        if self.timestamps.len() < 2 {
            return None;
        }
        let mut deltas: Vec<f64> = self.timestamps.windows(2).map(|w| w[1] - w[0]).collect();
        deltas.sort_by(f64::total_cmp);
        Some(deltas[deltas.len() / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SourceKind;

    #[test]
    fn test_frame_buckets_and_averages() {
        let readings = vec![
            Reading::new(10.2, SourceKind::Crypto).with("price", 100.0),
            Reading::new(10.7, SourceKind::Crypto).with("price", 102.0),
            Reading::new(11.1, SourceKind::Network).with("latency_ms", 30.0),
            Reading::new(13.0, SourceKind::Crypto).with("price", 99.0).with("symbol", "BTC"),
        ];
        let frame = Frame::from_readings(&readings, 1.0);
        assert_eq!(frame.timestamps, vec![10.0, 11.0, 13.0]);
        assert_eq!(frame.names(), vec!["crypto.price", "network.latency_ms"]);

        let price = frame.column("crypto.price").unwrap();
        assert_eq!(price[0], 101.0);
        assert!(price[1].is_nan());
        assert_eq!(price[2], 99.0);
        assert_eq!(frame.sample_interval(), Some(2.0));
        assert_eq!(
            frame.column("nope"),
            Err(AnalysisError::MissingParameter("nope".into()))
        );
    }

    #[test]
    fn test_cancellation_check() {
        let token = CancellationToken::new();
        assert!(check_cancelled(&token).is_ok());
        token.cancel();
        assert_eq!(check_cancelled(&token), Err(AnalysisError::Cancelled));
    }
}
