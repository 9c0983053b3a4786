//! matrixwatch -- cross-source anomaly analysis.
//!
//! This crate provides the live detection pipeline (rolling z-scores,
//! multi-source clustering, the anomaly index and the historical pattern
//! tracker), the offline batch analyzers, and the daemon wiring around them.

pub mod analysis;
pub mod api;
pub mod config;
pub mod detect;
pub mod notify;
pub mod patterns;
pub mod pipeline;
pub mod scheduler;
pub mod sensor;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::patterns::PredictionStore;
use crate::pipeline::{ReadingBus, SharedStatus, Stage};
use crate::sensor::{SensorRegistry, SystemSensor};
use crate::storage::Store;

/// Current wall time as unix seconds.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Resolve when the process receives Ctrl-C, cancelling `token`.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        token.cancel();
    });
}

/// Start the matrixwatch daemon: live stage, sensor producers, batch
/// scheduler, and the status API.
pub async fn serve(config: Config) -> Result<()> {
    let db_path = config.storage.db_path.clone();
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let store = Store::open(&db_path)?;

    let predictions = Arc::new(PredictionStore::open(store.clone(), config.patterns.clone()));
    let notifier = notify::from_config(&config.notify)?;
    let bus = ReadingBus::new(config.bus.capacity);
    let status = SharedStatus::default();
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let stage = Stage::new(
        config.clone(),
        store.clone(),
        predictions.clone(),
        notifier,
        bus.clone(),
        status.clone(),
        unix_now(),
    );
    let stage_task = tokio::spawn(stage.run(
        bus.subscribe(),
        Duration::from_millis(config.bus.tick_ms),
        cancel.clone(),
    ));

    let mut registry = SensorRegistry::new();
    if config.bus.system_sensor {
        registry.register(Arc::new(SystemSensor));
    }
    let producers = registry.spawn_producers(
        bus.clone(),
        Duration::from_secs(config.bus.poll_interval_secs),
        cancel.clone(),
    );

    let batch = scheduler::BatchScheduler::new(store.clone(), config.offline.clone())?;
    let batch_task = tokio::spawn(batch.run(cancel.clone()));

    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.api.bind))?;
    let app = api::router(api::state::AppState {
        status,
        predictions,
    });

    tracing::info!(%addr, sensors = registry.len(), "matrixwatch listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    cancel.cancel();
    futures::future::join_all(producers).await;
    let _ = batch_task.await;
    stage_task.await.context("analysis stage panicked")?;
    Ok(())
}
