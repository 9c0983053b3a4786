use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::advanced::{AdvancedAnalyzer, AdvancedReport};
use super::cluster::{ClusterAnalyzer, RetroCluster};
use super::correlation::{CorrelationAnalyzer, CorrelationReport};
use super::lag::{LagAnalyzer, LagReport};
use super::precursor::{PrecursorAnalyzer, PrecursorReport};
use super::{AnalysisError, Frame};
use crate::config::OfflineConfig;
use crate::storage::Store;

/// One batch analyzer, selectable from the CLI and the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Correlations,
    Lag,
    Clusters,
    Precursors,
    Advanced,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 5] = [
        AnalysisKind::Correlations,
        AnalysisKind::Lag,
        AnalysisKind::Clusters,
        AnalysisKind::Precursors,
        AnalysisKind::Advanced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Correlations => "correlations",
            AnalysisKind::Lag => "lag",
            AnalysisKind::Clusters => "clusters",
            AnalysisKind::Precursors => "precursors",
            AnalysisKind::Advanced => "advanced",
        }
    }

    fn needs_frame(&self) -> bool {
        !matches!(self, AnalysisKind::Clusters)
    }

    fn needs_anomalies(&self) -> bool {
        matches!(self, AnalysisKind::Clusters | AnalysisKind::Precursors)
    }
}

impl std::fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "analysis", content = "result", rename_all = "snake_case")]
pub enum AnalysisOutput {
    Correlations(CorrelationReport),
    Lag(LagReport),
    Clusters(Vec<RetroCluster>),
    Precursors(PrecursorReport),
    Advanced(AdvancedReport),
}

impl AnalysisOutput {
    /// One-line digest recorded in the job history.
    pub fn summary(&self) -> String {
        match self {
            AnalysisOutput::Correlations(r) => {
                format!("{} parameters, {} significant pairs", r.total_parameters, r.significant_count)
            }
            AnalysisOutput::Lag(r) => format!("{} pairs, {} causal candidates", r.total_pairs, r.causal_count),
            AnalysisOutput::Clusters(c) => format!(
                "{} clusters, {} multi-source",
                c.len(),
                c.iter().filter(|c| c.is_multi_source).count()
            ),
            AnalysisOutput::Precursors(r) => format!("{} precursors", r.precursor_count),
            AnalysisOutput::Advanced(r) => format!(
                "{} parameters, {} MI pairs, {} suspicious periodicities",
                r.parameters_analyzed,
                r.significant_mi_pairs.len(),
                r.suspicious_periodicities.len()
            ),
        }
    }
}

/// Run one analyzer over the stored history.
pub fn run_on(
    kind: AnalysisKind,
    config: &OfflineConfig,
    frame: &Frame,
    anomalies: &[crate::detect::AnomalyEvent],
    cancel: &CancellationToken,
) -> Result<AnalysisOutput, AnalysisError> {
    Ok(match kind {
        AnalysisKind::Correlations => AnalysisOutput::Correlations(CorrelationAnalyzer::from_config(config).analyze(frame, cancel)?),
        AnalysisKind::Lag => AnalysisOutput::Lag(LagAnalyzer::from_config(config).analyze(frame, cancel)?),
        AnalysisKind::Clusters => AnalysisOutput::Clusters(ClusterAnalyzer::from_config(config).analyze(anomalies, cancel)?),
        AnalysisKind::Precursors => {
            AnalysisOutput::Precursors(PrecursorAnalyzer::from_config(config).analyze(frame, anomalies, cancel)?)
        }
        AnalysisKind::Advanced => AnalysisOutput::Advanced(AdvancedAnalyzer::from_config(config).analyze(frame, cancel)?),
    })
}

/// Load `lookback_hours` of history ending at `now`, run `kind` on a
/// blocking thread and record the outcome in the job history.
pub async fn run_analysis(
    store: &Store,
    config: &OfflineConfig,
    kind: AnalysisKind,
    lookback_hours: f64,
    now: f64,
    cancel: CancellationToken,
) -> Result<AnalysisOutput> {
    let started = Instant::now();
    let since = now - lookback_hours * 3600.0;
    info!(analysis = %kind, lookback_hours, "starting batch analysis");

    let job_store = store.clone();
    let job_config = config.clone();
    let outcome = tokio::task::spawn_blocking(move || -> Result<AnalysisOutput> {
        let frame = if kind.needs_frame() {
            let readings = job_store.load_readings(since, now).context("failed to load readings")?;
            Frame::from_readings(&readings, job_config.bucket_secs)
        } else {
            Frame::default()
        };
        let anomalies = if kind.needs_anomalies() {
            job_store.load_anomalies(since, now).context("failed to load anomalies")?
        } else {
            Vec::new()
        };
        Ok(run_on(kind, &job_config, &frame, &anomalies, &cancel)?)
    })
    .await
    .context("analysis task panicked")?;

    let duration_ms = started.elapsed().as_millis() as u64;
    let (status, summary) = match &outcome {
        Ok(output) => ("ok", output.summary()),
        Err(e) if matches!(e.downcast_ref::<AnalysisError>(), Some(AnalysisError::Cancelled)) => {
            ("cancelled", e.to_string())
        }
        Err(e) => ("failed", format!("{e:#}")),
    };
    if let Err(e) = store.record_job(kind.as_str(), status, &summary, duration_ms) {
        warn!(analysis = %kind, error = %e, "failed to record job history");
    }
    info!(analysis = %kind, status, duration_ms, summary = %summary, "batch analysis finished");
    outcome
}
