use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AppState;

/// Health check endpoint handler
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "academic-rs",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness: the broker connection must be up
pub async fn health_ready(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    if !state.producer.broker().is_connected() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(json!({
        "status": "ready",
        "broker": "connected"
    })))
}
