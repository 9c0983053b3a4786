//! API route definitions.

use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

use super::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/predictions", get(predictions))
        .route("/index", get(index))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.status.read().clone();
    Json(json!({ "data": snapshot, "meta": meta() }))
}

async fn predictions(State(state): State<AppState>) -> Json<Value> {
    let active = state.predictions.active();
    Json(json!({
        "data": active,
        "meta": { "total": active.len(), "timestamp": chrono::Utc::now().to_rfc3339() }
    }))
}

async fn index(State(state): State<AppState>) -> Json<Value> {
    let latest = state.status.read().latest_index.clone();
    match latest {
        Some(snapshot) => Json(json!({ "data": snapshot, "meta": meta() })),
        None => Json(json!({ "data": null, "meta": { "message": "no index computed yet" } })),
    }
}
