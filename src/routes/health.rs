use axum::{extract::State, Json};
use serde_json::{json, Value};
use tracing::warn;

use super::AppState;
use crate::error::{AppError, AppResult};

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// 503 until the store answers.
pub async fn ready(State(state): State<AppState>) -> AppResult<Json<Value>> {
    if let Err(e) = state.store.ping().await {
        warn!(error = %e, "readiness check failed");
        return Err(AppError::unavailable("store unreachable"));
    }
    Ok(Json(json!({ "status": "ready" })))
}
