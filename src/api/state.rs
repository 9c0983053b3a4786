use std::sync::Arc;

use crate::patterns::PredictionStore;
use crate::pipeline::SharedStatus;

/// Everything handlers can see: immutable snapshots, never live state.
#[derive(Clone)]
pub struct AppState {
    pub status: SharedStatus,
    pub predictions: Arc<PredictionStore>,
}
