//! Information-theoretic and spectral statistics: Shannon entropy,
//! histogram mutual information and FFT periodicity detection.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::stats::summarize;
use super::{check_cancelled, AnalysisError, Frame};
use crate::config::OfflineConfig;

/// Periods shorter than a day are flagged as suspicious.
pub const SUSPICIOUS_PERIOD_SECS: f64 = 86_400.0;

/// A spectral bin must carry this multiple of the mean candidate power.
const PEAK_RATIO: f64 = 5.0;
const MAX_DOMINANT_PERIODS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiMatrix {
    pub names: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiPair {
    pub param1: String,
    pub param2: String,
    pub mutual_information: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodEntry {
    pub period_seconds: f64,
    pub period_hours: f64,
    pub power: f64,
    pub is_suspicious: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Periodicity {
    pub parameter: String,
    pub dominant_periods: Vec<PeriodEntry>,
    pub has_periodicity: bool,
    pub sampling_rate_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedReport {
    pub mutual_information_matrix: MiMatrix,
    pub significant_mi_pairs: Vec<MiPair>,
    pub periodicities: Vec<Periodicity>,
    pub suspicious_periodicities: Vec<Periodicity>,
    pub entropies: Vec<(String, f64)>,
    pub parameters_analyzed: usize,
}

pub struct AdvancedAnalyzer {
    n_bins: usize,
    mi_threshold: f64,
    min_samples: usize,
    min_period: f64,
    max_period: f64,
}

impl AdvancedAnalyzer {
    pub fn new(n_bins: usize, mi_threshold: f64, min_samples: usize) -> Self {
        Self {
            n_bins: n_bins.max(2),
            mi_threshold,
            min_samples,
            min_period: 0.0,
            max_period: f64::INFINITY,
        }
    }

    pub fn with_period_bounds(mut self, min_period: f64, max_period: f64) -> Self {
        self.min_period = min_period;
        self.max_period = max_period;
        self
    }

    pub fn from_config(config: &OfflineConfig) -> Self {
        Self::new(config.mi_bins, config.mi_threshold, config.min_samples)
            .with_period_bounds(2.0 * config.bucket_secs, config.lookback_hours * 3600.0)
    }

    /// Equal-width bin index of every finite value, or `None` when the
    /// series has no finite values.
    fn bin_indices(&self, values: &[f64]) -> Option<Vec<Option<usize>>> {
        let (lo, hi) = values
            .iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        if !lo.is_finite() {
            return None;
        }
        let width = (hi - lo) / self.n_bins as f64;
        Some(
            values
                .iter()
                .map(|v| {
                    if !v.is_finite() {
                        return None;
                    }
                    if width <= 0.0 {
                        return Some(0);
                    }
                    Some((((v - lo) / width) as usize).min(self.n_bins - 1))
                })
                .collect(),
        )
    }

    /// Shannon entropy in bits of the binned distribution.
    pub fn entropy(&self, values: &[f64]) -> f64 {
        let Some(bins) = self.bin_indices(values) else {
            return 0.0;
        };
        let mut counts = vec![0usize; self.n_bins];
        for b in bins.into_iter().flatten() {
            counts[b] += 1;
        }
        shannon(&counts)
    }

    /// Histogram estimate of `I(X;Y)` in bits over pairwise-complete
    /// samples. Never negative.
    pub fn mutual_information(&self, x: &[f64], y: &[f64]) -> Result<f64, AnalysisError> {
        let (xs, ys): (Vec<f64>, Vec<f64>) = x
            .iter()
            .zip(y)
            .filter(|(a, b)| a.is_finite() && b.is_finite())
            .map(|(a, b)| (*a, *b))
            .unzip();
        if xs.len() < self.min_samples {
            return Err(AnalysisError::InsufficientSamples {
                needed: self.min_samples,
                have: xs.len(),
            });
        }
        let (Some(bx), Some(by)) = (self.bin_indices(&xs), self.bin_indices(&ys)) else {
            return Err(AnalysisError::EmptySeries);
        };

        let k = self.n_bins;
        let mut joint = vec![0usize; k * k];
        let mut px = vec![0usize; k];
        let mut py = vec![0usize; k];
        for (a, b) in bx.into_iter().zip(by).filter_map(|(a, b)| Some((a?, b?))) {
            joint[a * k + b] += 1;
            px[a] += 1;
            py[b] += 1;
        }
        let mi = shannon(&px) + shannon(&py) - shannon(&joint);
        Ok(mi.max(0.0))
    }

    pub fn mi_matrix(&self, frame: &Frame, cancel: &CancellationToken) -> Result<MiMatrix, AnalysisError> {
        let names: Vec<&String> = frame
            .columns
            .iter()
            .filter(|(_, col)| summarize(col.iter().copied()).count >= self.min_samples)
            .map(|(name, _)| name)
            .collect();
        let n = names.len();
        let mut values = vec![vec![0.0; n]; n];
        for i in 0..n {
            check_cancelled(cancel)?;
            values[i][i] = self.entropy(&frame.columns[names[i]]);
            for j in (i + 1)..n {
                let mi = match self.mutual_information(&frame.columns[names[i]], &frame.columns[names[j]]) {
                    Ok(mi) => mi,
                    Err(e) => {
                        debug!(param1 = %names[i], param2 = %names[j], error = %e, "mutual information skipped");
                        0.0
                    }
                };
                values[i][j] = mi;
                values[j][i] = mi;
            }
        }
        Ok(MiMatrix {
            names: names.into_iter().cloned().collect(),
            values,
        })
    }

    pub fn significant_mi_pairs(&self, matrix: &MiMatrix) -> Vec<MiPair> {
        let mut pairs = Vec::new();
        for i in 0..matrix.names.len() {
            for j in (i + 1)..matrix.names.len() {
                if matrix.values[i][j] > self.mi_threshold {
                    pairs.push(MiPair {
                        param1: matrix.names[i].clone(),
                        param2: matrix.names[j].clone(),
                        mutual_information: matrix.values[i][j],
                    });
                }
            }
        }
        pairs.sort_by(|a, b| b.mutual_information.total_cmp(&a.mutual_information));
        pairs
    }

    /// Dominant periods of one parameter from its power spectrum.
    pub fn detect_periodicity(&self, frame: &Frame, parameter: &str) -> Result<Periodicity, AnalysisError> {
        let column = frame.column(parameter)?;
        let summary = summarize(column.iter().copied());
        if summary.count < self.min_samples {
            return Err(AnalysisError::InsufficientSamples {
                needed: self.min_samples,
                have: summary.count,
            });
        }
        let dt = frame.sample_interval().filter(|d| *d > 0.0).ok_or(AnalysisError::EmptySeries)?;

        // Gaps are filled with the mean so they add no spectral energy.
        let fft_size = column.len().next_power_of_two();
        let mut re: Vec<f64> = column
            .iter()
            .map(|v| if v.is_finite() { v - summary.mean } else { 0.0 })
            .chain(std::iter::repeat(0.0))
            .take(fft_size)
            .collect();
        let mut im = vec![0.0; fft_size];
        Fft::new(fft_size).transform(&mut re, &mut im);

        let power: Vec<f64> = re.iter().zip(&im).map(|(r, i)| r * r + i * i).collect();
        let period_of = |k: usize| fft_size as f64 * dt / k as f64;
        let candidates: Vec<usize> = (1..fft_size / 2)
            .filter(|k| (self.min_period..=self.max_period).contains(&period_of(*k)))
            .collect();

        let mut dominant_periods = Vec::new();
        if !candidates.is_empty() {
            let mean_power = candidates.iter().map(|k| power[*k]).sum::<f64>() / candidates.len() as f64;
            let mut peaks: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|k| {
                    let p = power[*k];
                    p > f64::EPSILON
                        && p > PEAK_RATIO * mean_power
                        && p >= power[k - 1]
                        && power.get(k + 1).map_or(true, |next| p >= *next)
                })
                .collect();
            peaks.sort_by(|a, b| power[*b].total_cmp(&power[*a]));
            dominant_periods = peaks
                .into_iter()
                .take(MAX_DOMINANT_PERIODS)
                .map(|k| {
                    let period_seconds = period_of(k);
                    PeriodEntry {
                        period_seconds,
                        period_hours: period_seconds / 3600.0,
                        power: power[k],
                        is_suspicious: period_seconds < SUSPICIOUS_PERIOD_SECS,
                    }
                })
                .collect();
        }

        Ok(Periodicity {
            parameter: parameter.to_string(),
            has_periodicity: !dominant_periods.is_empty(),
            dominant_periods,
            sampling_rate_hz: 1.0 / dt,
        })
    }

    pub fn analyze(&self, frame: &Frame, cancel: &CancellationToken) -> Result<AdvancedReport, AnalysisError> {
        let mutual_information_matrix = self.mi_matrix(frame, cancel)?;
        let significant_mi_pairs = self.significant_mi_pairs(&mutual_information_matrix);

        let mut periodicities = Vec::new();
        let mut entropies = Vec::new();
        for name in &mutual_information_matrix.names {
            check_cancelled(cancel)?;
            entropies.push((name.clone(), self.entropy(&frame.columns[name])));
            match self.detect_periodicity(frame, name) {
                Ok(p) => periodicities.push(p),
                Err(e) => debug!(parameter = %name, error = %e, "periodicity skipped"),
            }
        }
        let suspicious_periodicities: Vec<Periodicity> = periodicities
            .iter()
            .filter(|p| p.dominant_periods.iter().any(|d| d.is_suspicious))
            .cloned()
            .collect();

        info!(
            parameters = mutual_information_matrix.names.len(),
            mi_pairs = significant_mi_pairs.len(),
            periodic = periodicities.iter().filter(|p| p.has_periodicity).count(),
            "advanced analysis complete"
        );
        Ok(AdvancedReport {
            parameters_analyzed: mutual_information_matrix.names.len(),
            mutual_information_matrix,
            significant_mi_pairs,
            periodicities,
            suspicious_periodicities,
            entropies,
        })
    }
}

fn shannon(counts: &[usize]) -> f64 {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    counts
        .iter()
        .filter(|c| **c > 0)
        .map(|c| {
            let p = *c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Iterative radix-2 Cooley-Tukey transform with precomputed twiddles.
struct Fft {
    twiddles: Vec<(f64, f64)>,
}

impl Fft {
    fn new(size: usize) -> Self {
        let n = size.next_power_of_two();
        let twiddles = (0..n / 2)
            .map(|k| {
                let angle = -2.0 * std::f64::consts::PI * k as f64 / n as f64;
                (angle.cos(), angle.sin())
            })
            .collect();
        Self { twiddles }
    }

    fn transform(&self, re: &mut [f64], im: &mut [f64]) {
        let n = re.len();
        debug_assert!(n.is_power_of_two());
        debug_assert_eq!(n, im.len());

        let mut j = 0usize;
        for i in 1..n {
            let mut bit = n >> 1;
            while j & bit != 0 {
                j ^= bit;
                bit >>= 1;
            }
            j |= bit;
            if i < j {
                re.swap(i, j);
                im.swap(i, j);
            }
        }

        let mut len = 2;
        while len <= n {
            let half = len / 2;
            let step = n / len;
            for start in (0..n).step_by(len) {
                for k in 0..half {
                    let (w_re, w_im) = self.twiddles[k * step];
                    let a = start + k;
                    let b = a + half;
                    let t_re = re[b] * w_re - im[b] * w_im;
                    let t_im = re[b] * w_im + im[b] * w_re;
                    re[b] = re[a] - t_re;
                    im[b] = im[a] - t_im;
                    re[a] += t_re;
                    im[a] += t_im;
                }
            }
            len <<= 1;
        }
    }
}
