//! API layer -- axum routes over read-only snapshots.

mod routes;
pub mod state;

use self::state::AppState;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternConfig;
    use crate::detect::{IndexSnapshot, IndexStatus};
    use crate::patterns::{EventCategory, Prediction, PredictionStore};
    use crate::pipeline::SharedStatus;
    use crate::storage::Store;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state() -> AppState {
        let store = Store::open_in_memory().unwrap();
        let predictions = Arc::new(PredictionStore::open(store, PatternConfig::default()));
        let prediction = Prediction {
            condition: "L3_crypto_news_system".into(),
            event_type: "btc_pump_4h".into(),
            category: EventCategory::Crypto,
            probability: 0.3,
            sample_size: 12,
            min_time_h: 1.0,
            max_time_h: 4.0,
            generated_at: 0.0,
            expires_at: 1e12,
            temporal: false,
            region: None,
        };
        predictions.save_predictions(vec![prediction], 0.0).unwrap();
        AppState {
            status: SharedStatus::default(),
            predictions,
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (code, body) = get_json(router(state()), "/api/v1/health").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_predictions_and_status() {
        let state = state();
        state.status.write().spool_depth = 4;
        let (_, preds) = get_json(router(state.clone()), "/api/v1/predictions").await;
        assert_eq!(preds["meta"]["total"], 1);
        assert_eq!(preds["data"][0]["event_type"], "btc_pump_4h");

        let (_, status) = get_json(router(state), "/api/v1/status").await;
        assert_eq!(status["data"]["spool_depth"], 4);
    }

    #[tokio::test]
    async fn test_index_before_and_after_first_snapshot() {
        let state = state();
        let (_, empty) = get_json(router(state.clone()), "/api/v1/index").await;
        assert!(empty["data"].is_null());

        state.status.write().latest_index = Some(IndexSnapshot {
            timestamp: 5.0,
            index: 61.0,
            breakdown: BTreeMap::new(),
            baseline_ratio: 2.0,
            status: IndexStatus::High,
        });
        let (_, body) = get_json(router(state), "/api/v1/index").await;
        assert_eq!(body["data"]["status"], "high");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (code, _) = get_json(router(state()), "/nope").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }
}
