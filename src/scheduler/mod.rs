//! Cron-driven batch analysis over the durable store.
//!
//! Runs are sequential: a run that overlaps the next fire time delays it
//! rather than running twice. Each run works on its own snapshot of history
//! and never touches the live stage.

pub mod cron;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::analysis::runner::{run_analysis, AnalysisKind};
use crate::config::OfflineConfig;
use crate::storage::Store;

pub struct BatchScheduler {
    schedule: ::cron::Schedule,
    store: Store,
    config: OfflineConfig,
    analyses: Vec<AnalysisKind>,
}

impl BatchScheduler {
    pub fn new(store: Store, config: OfflineConfig) -> Result<Self> {
        Ok(Self {
            schedule: cron::parse(&config.schedule)?,
            store,
            config,
            analyses: AnalysisKind::ALL.to_vec(),
        })
    }

    /// Restrict scheduled runs to `analyses`.
    pub fn with_analyses(mut self, analyses: Vec<AnalysisKind>) -> Self {
        self.analyses = analyses;
        self
    }

    /// Run every configured analysis once.
    pub async fn run_once(&self, cancel: &CancellationToken) -> usize {
        let mut completed = 0;
        for kind in &self.analyses {
            if cancel.is_cancelled() {
                break;
            }
            match run_analysis(
                &self.store,
                &self.config,
                *kind,
                self.config.lookback_hours,
                crate::unix_now(),
                cancel.child_token(),
            )
            .await
            {
                Ok(_) => completed += 1,
                Err(e) => warn!(analysis = %kind, error = %e, "scheduled analysis failed"),
            }
        }
        completed
    }

    /// Sleep until each fire time and run the batch, until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(schedule = %self.config.schedule, analyses = self.analyses.len(), "batch scheduler started");
        loop {
            let Some(next) = cron::next_after(&self.schedule, Utc::now()) else {
                error!(schedule = %self.config.schedule, "schedule has no future fire times");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            let completed = self.run_once(&cancel).await;
            info!(fired_at = %next, completed, "scheduled batch finished");
        }
        info!("batch scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{Reading, SourceKind};

    #[tokio::test]
    async fn test_run_once_records_each_job() {
        let store = Store::open_in_memory().unwrap();
        let now = crate::unix_now();
        for i in 0..60 {
            let t = now - 100.0 + i as f64;
            store
                .save_reading(&Reading::new(t, SourceKind::System).with("cpu", (i % 7) as f64))
                .unwrap();
        }
        let scheduler = BatchScheduler::new(store.clone(), OfflineConfig::default())
            .unwrap()
            .with_analyses(vec![AnalysisKind::Correlations, AnalysisKind::Clusters]);
        assert_eq!(scheduler.run_once(&CancellationToken::new()).await, 2);
        assert_eq!(store.job_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_scheduler_runs_nothing() {
        let store = Store::open_in_memory().unwrap();
        let scheduler = BatchScheduler::new(store, OfflineConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(scheduler.run_once(&cancel).await, 0);
        scheduler.run(cancel).await;
    }

    #[test]
    fn test_invalid_schedule_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let config = OfflineConfig {
            schedule: "nope".into(),
            ..OfflineConfig::default()
        };
        assert!(BatchScheduler::new(store, config).is_err());
    }
}
