//! Instance discovery endpoint
//!
//! The rotator-creation path uses this to pick a placement instance; the
//! listing comes straight from the heartbeat keyspace.

use axum::extract::State;
use axum::Json;

use crate::error::Result;
use crate::models::ActiveInstance;

use super::super::server::AppState;

/// `GET /api/instances`
pub async fn list_instances(State(state): State<AppState>) -> Result<Json<Vec<ActiveInstance>>> {
    let instances = state
        .queue
        .list_instances(state.rotator_ports.port_start, state.rotator_ports.port_end)
        .await?;
    Ok(Json(instances))
}
