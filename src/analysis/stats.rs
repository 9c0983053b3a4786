//! Statistical primitives shared by the live detector and the batch
//! analyzers. Standard deviation is the sample (n - 1) estimator.

use serde::{Deserialize, Serialize};

/// Spread below this fraction of the mean's magnitude is rounding noise.
const RELATIVE_TOLERANCE: f64 = 1e-12;

/// True when a standard deviation carries no signal relative to its mean.
fn negligible_spread(std: f64, mean: f64) -> bool {
    std.is_nan() || std <= mean.abs() * RELATIVE_TOLERANCE
}

/// Count, mean and sample variance of a series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub variance: f64,
}

impl Summary {
    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Fewer than two values, or a spread that vanishes relative to the mean.
    pub fn is_degenerate(&self) -> bool {
        self.count < 2 || negligible_spread(self.std_dev(), self.mean)
    }

    /// `(value - mean) / std`, or `None` when the spread is degenerate.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.is_degenerate() {
            return None;
        }
        Some((value - self.mean) / self.std_dev())
    }
}

/// Welford summary over the finite values of `values`.
pub fn summarize(values: impl IntoIterator<Item = f64>) -> Summary {
    let mut count = 0usize;
    let mut mean = 0.0;
    let mut m2 = 0.0;
    for x in values.into_iter().filter(|v| v.is_finite()) {
        count += 1;
        let delta = x - mean;
        mean += delta / count as f64;
        m2 += delta * (x - mean);
    }
    let variance = if count > 1 { m2 / (count - 1) as f64 } else { 0.0 };
    Summary {
        count,
        mean: if count == 0 { 0.0 } else { mean },
        variance,
    }
}

/// Pearson correlation over pairwise-complete observations.
///
/// Returns the coefficient clamped to `[-1, 1]` and the number of pairs used,
/// or `None` for fewer than two pairs or a constant series.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<(f64, usize)> {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .collect();
    let n = pairs.len();
    if n < 2 {
        return None;
    }
    let mx = pairs.iter().map(|p| p.0).sum::<f64>() / n as f64;
    let my = pairs.iter().map(|p| p.1).sum::<f64>() / n as f64;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in &pairs {
        let dx = a - mx;
        let dy = b - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    let nf = n as f64;
    if negligible_spread((sxx / nf).sqrt(), mx) || negligible_spread((syy / nf).sqrt(), my) {
        return None;
    }
    let r = sxy / (sxx.sqrt() * syy.sqrt());
    Some((r.clamp(-1.0, 1.0), n))
}

/// Pearson correlation of `x[t]` against `y[t + shift]`.
pub fn pearson_shifted(x: &[f64], y: &[f64], shift: i64) -> Option<(f64, usize)> {
    let n = x.len().min(y.len());
    let s = shift.unsigned_abs() as usize;
    if s >= n {
        return None;
    }
    if shift >= 0 {
        pearson(&x[..n - s], &y[s..n])
    } else {
        pearson(&x[s..n], &y[..n - s])
    }
}
