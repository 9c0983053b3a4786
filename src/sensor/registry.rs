//! Registry of sensors keyed by source identity.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Sensor, SourceKind};
use crate::pipeline::bus::ReadingBus;

/// At most one sensor per source.
#[derive(Default, Clone)]
pub struct SensorRegistry {
    sensors: BTreeMap<SourceKind, Arc<dyn Sensor>>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sensor, replacing any previous one for the same source.
    pub fn register(&mut self, sensor: Arc<dyn Sensor>) -> Option<Arc<dyn Sensor>> {
        let source = sensor.source();
        let previous = self.sensors.insert(source, sensor);
        if previous.is_some() {
            warn!(%source, "replacing already registered sensor");
        }
        previous
    }

    pub fn get(&self, source: SourceKind) -> Option<Arc<dyn Sensor>> {
        self.sensors.get(&source).cloned()
    }

    pub fn sources(&self) -> Vec<SourceKind> {
        self.sensors.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Spawn one producer task per sensor, each publishing into `bus` every
    /// `interval` until `cancel` fires. Failed polls are logged and skipped.
    pub fn spawn_producers(
        &self,
        bus: ReadingBus,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.sensors
            .values()
            .cloned()
            .map(|sensor| {
                let bus = bus.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let source = sensor.source();
                    info!(%source, "sensor producer started");
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => {}
                        }
                        match sensor.produce().await {
                            Ok(reading) => {
                                let receivers = bus.publish(reading);
                                debug!(%source, receivers, "reading published");
                            }
                            Err(e) => warn!(%source, error = %e, "sensor poll failed"),
                        }
                    }
                    info!(%source, "sensor producer stopped");
                })
            })
            .collect()
    }
}
