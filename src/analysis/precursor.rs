//! Precursor mining: what the other parameters looked like in the seconds
//! before each anomaly.
//!
//! For every anomaly and every configured window `w`, the frame rows in
//! `[t - w, t)` are compared against each parameter's whole-frame baseline.
//! A window whose mean sits above or below the baseline by more than the z
//! threshold counts as `elevated` or `depressed`; a window whose spread is
//! more than twice the baseline spread counts as `volatile`. A pattern that
//! recurs before more than `min_frequency` of the same anomaly type is a
//! precursor.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::stats::{summarize, Summary};
use super::{check_cancelled, AnalysisError, Frame};
use crate::config::OfflineConfig;
use crate::detect::AnomalyEvent;

const VOLATILITY_RATIO: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Elevated,
    Depressed,
    Volatile,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Elevated => "elevated",
            PatternType::Depressed => "depressed",
            PatternType::Volatile => "volatile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecursorPattern {
    /// `source.field` of the anomalies this pattern precedes.
    pub anomaly_type: String,
    pub window_secs: u64,
    /// Parameter whose behavior forms the pattern.
    pub parameter: String,
    pub pattern_type: PatternType,
    pub count: usize,
    pub total: usize,
    pub frequency: f64,
    pub is_precursor: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub window_secs: u64,
    pub total_windows: usize,
    pub parameters_analyzed: usize,
    pub patterns: Vec<PrecursorPattern>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecursorReport {
    pub by_window: Vec<WindowSummary>,
    pub all_precursors: Vec<PrecursorPattern>,
    pub precursor_count: usize,
    pub windows_analyzed: Vec<u64>,
    pub report: String,
}

pub struct PrecursorAnalyzer {
    windows: Vec<u64>,
    min_frequency: f64,
    z_threshold: f64,
}

impl PrecursorAnalyzer {
    pub fn new(windows: Vec<u64>, min_frequency: f64, z_threshold: f64) -> Self {
        Self {
            windows,
            min_frequency,
            z_threshold,
        }
    }

    pub fn from_config(config: &OfflineConfig) -> Self {
        Self::new(
            config.precursor_windows.clone(),
            config.precursor_min_frequency,
            config.precursor_z_threshold,
        )
    }

    /// Row range of the frame inside `[end - window, end)`.
    pub fn window_rows(frame: &Frame, end: f64, window: u64) -> std::ops::Range<usize> {
        let start = end - window as f64;
        let lo = frame.timestamps.partition_point(|t| *t < start);
        let hi = frame.timestamps.partition_point(|t| *t < end);
        lo..hi.max(lo)
    }

    fn classify(&self, baseline: &Summary, window: &Summary) -> Vec<PatternType> {
        let mut found = Vec::new();
        if window.count == 0 {
            return found;
        }
        if let Some(z) = baseline.z_score(window.mean) {
            if z > self.z_threshold {
                found.push(PatternType::Elevated);
            } else if z < -self.z_threshold {
                found.push(PatternType::Depressed);
            }
        }
        if window.count >= 2 && baseline.count >= 2 && window.std_dev() > VOLATILITY_RATIO * baseline.std_dev() {
            found.push(PatternType::Volatile);
        }
        found
    }

    fn analyze_window(
        &self,
        frame: &Frame,
        baselines: &BTreeMap<&str, Summary>,
        anomalies: &[(String, f64)],
        window: u64,
        cancel: &CancellationToken,
    ) -> Result<WindowSummary, AnalysisError> {
        // (anomaly_type, parameter, pattern) -> occurrences; anomaly_type -> windows
        let mut counts: BTreeMap<(&str, &str, PatternType), usize> = BTreeMap::new();
        let mut totals: BTreeMap<&str, usize> = BTreeMap::new();

        for (i, (anomaly_type, timestamp)) in anomalies.iter().enumerate() {
            if i % 256 == 0 {
                check_cancelled(cancel)?;
            }
            let rows = Self::window_rows(frame, *timestamp, window);
            if rows.is_empty() {
                continue;
            }
            *totals.entry(anomaly_type.as_str()).or_default() += 1;
            for (name, baseline) in baselines {
                let Some(col) = frame.columns.get(*name) else {
                    continue;
                };
                let stats = summarize(col[rows.clone()].iter().copied());
                for pattern in self.classify(baseline, &stats) {
                    *counts.entry((anomaly_type.as_str(), *name, pattern)).or_default() += 1;
                }
            }
        }

        let mut patterns: Vec<PrecursorPattern> = counts
            .into_iter()
            .map(|((anomaly_type, parameter, pattern_type), count)| {
                let total = totals.get(anomaly_type).copied().unwrap_or(0).max(1);
                let frequency = count as f64 / total as f64;
                PrecursorPattern {
                    anomaly_type: anomaly_type.to_string(),
                    window_secs: window,
                    parameter: parameter.to_string(),
                    pattern_type,
                    count,
                    total,
                    frequency,
                    is_precursor: frequency > self.min_frequency,
                }
            })
            .collect();
        patterns.sort_by(|a, b| b.frequency.total_cmp(&a.frequency));

        Ok(WindowSummary {
            window_secs: window,
            total_windows: totals.values().sum(),
            parameters_analyzed: baselines.len(),
            patterns,
        })
    }

    pub fn analyze(&self, frame: &Frame, anomalies: &[AnomalyEvent], cancel: &CancellationToken) -> Result<PrecursorReport, AnalysisError> {
        let baselines: BTreeMap<&str, Summary> = frame
            .columns
            .iter()
            .map(|(name, col)| (name.as_str(), summarize(col.iter().copied())))
            .filter(|(_, s)| s.count >= 2)
            .collect();
        let anomalies: Vec<(String, f64)> = anomalies
            .iter()
            .filter(|a| a.timestamp.is_finite())
            .map(|a| (format!("{}.{}", a.source, a.parameter), a.timestamp))
            .collect();
        debug!(anomalies = anomalies.len(), parameters = baselines.len(), "mining precursors");

        let mut by_window = Vec::with_capacity(self.windows.len());
        for window in &self.windows {
            by_window.push(self.analyze_window(frame, &baselines, &anomalies, *window, cancel)?);
        }

        let mut all_precursors: Vec<PrecursorPattern> = by_window
            .iter()
            .flat_map(|w| w.patterns.iter().filter(|p| p.is_precursor).cloned())
            .collect();
        all_precursors.sort_by(|a, b| b.frequency.total_cmp(&a.frequency));

        let mut report = PrecursorReport {
            precursor_count: all_precursors.len(),
            windows_analyzed: self.windows.clone(),
            by_window,
            all_precursors,
            report: String::new(),
        };
        report.report = render(&report, anomalies.len());
        info!(precursors = report.precursor_count, "precursor analysis complete");
        Ok(report)
    }
}

fn render(report: &PrecursorReport, anomaly_count: usize) -> String {
    let mut out = String::new();
    let rule = "=".repeat(60);
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "PRECURSOR ANALYSIS REPORT");
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Anomalies analyzed: {anomaly_count}");
    let _ = writeln!(out, "Precursors found:   {}", report.precursor_count);
    for window in &report.by_window {
        let _ = writeln!(
            out,
            "\n[{}s window] {} windows, {} parameters",
            window.window_secs, window.total_windows, window.parameters_analyzed
        );
        let precursors: Vec<&PrecursorPattern> = window.patterns.iter().filter(|p| p.is_precursor).collect();
        if precursors.is_empty() {
            let _ = writeln!(out, "  no recurring precursors");
        }
        for p in precursors {
            let _ = writeln!(
                out,
                "  {} {} before {}: {}/{} ({:.0}%)",
                p.parameter,
                p.pattern_type.as_str(),
                p.anomaly_type,
                p.count,
                p.total,
                p.frequency * 100.0
            );
        }
    }
    out
}
