//! Health endpoint

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::error::Result;

use super::super::server::AppState;

/// `GET /health`
pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>> {
    let db_latency = state.db.health_check().await?;
    let queue_size = state.queue.size().await?;

    Ok(Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "db_latency_ms": db_latency.as_millis() as u64,
        "queue_size": queue_size,
    })))
}
