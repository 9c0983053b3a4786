use std::collections::VecDeque;

use crate::analysis::stats::{self, Summary};
use crate::detect::DetectError;

/// Bounded FIFO of the most recent values for one parameter.
///
/// Standard deviation is the sample (n - 1) estimator throughout the crate.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a value, evicting the oldest when full.
    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn summary(&self) -> Summary {
        stats::summarize(self.values())
    }

    pub fn mean(&self) -> f64 {
        self.summary().mean
    }

    pub fn variance(&self) -> f64 {
        self.summary().variance
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Z = (value - mean) / std_dev over the current contents.
    ///
    /// A window with fewer than `min_history` values, or with zero spread,
    /// yields an error the caller treats as "no anomaly".
    pub fn z_score(&self, value: f64, min_history: usize) -> Result<f64, DetectError> {
        let needed = min_history.max(2);
        if self.values.len() < needed {
            return Err(DetectError::InsufficientHistory {
                needed,
                have: self.values.len(),
            });
        }
        self.summary().z_score(value).ok_or(DetectError::ZeroVariance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats() {
        let mut w = SlidingWindow::new(10);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            w.push(v);
        }
        assert_eq!(w.mean(), 3.0);
        // Sample variance of 1..5 is 2.5
        assert!((w.variance() - 2.5).abs() < 1e-12);
        let z = w.z_score(10.0, 5).unwrap();
        assert!((z - 7.0 / 2.5f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_length_never_exceeds_capacity_and_evicts_oldest() {
        let mut w = SlidingWindow::new(10);
        for i in 0..250 {
            w.push(i as f64);
            assert!(w.len() <= 10);
        }
        assert_eq!(w.len(), 10);
        let contents: Vec<f64> = w.values().collect();
        assert_eq!(contents, (240..250).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_z_score_matches_direct_recomputation() {
        let data = [3.2, -1.0, 7.5, 0.25, 9.0, 4.4, -3.3, 2.0, 8.8, 1.1, 5.5, 6.0];
        let mut w = SlidingWindow::new(8);
        for v in data {
            w.push(v);
        }
        let tail = &data[data.len() - 8..];
        let mean = tail.iter().sum::<f64>() / 8.0;
        let var = tail.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 7.0;
        let expected = (12.0 - mean) / var.sqrt();
        assert!((w.z_score(12.0, 2).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_windows_are_errors_not_faults() {
        let mut w = SlidingWindow::new(100);
        for _ in 0..5 {
            w.push(1.0);
        }
        assert_eq!(
            w.z_score(2.0, 10),
            Err(DetectError::InsufficientHistory { needed: 10, have: 5 })
        );
        for _ in 0..20 {
            w.push(1.0);
        }
        assert_eq!(w.z_score(2.0, 10), Err(DetectError::ZeroVariance));
    }

    #[test]
    fn test_small_scale_parameters_still_score() {
        let mut w = SlidingWindow::new(100);
        for i in 0..20 {
            w.push(1e-9 + (i % 2) as f64 * 1e-10);
        }
        let z = w.z_score(5e-9, 10).unwrap();
        assert!(z > 3.0);
    }
}
