//! Rotating proxy management endpoints

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::error::Result;
use crate::models::{CreateRotatorRequest, RotatorInfo};

use super::super::server::AppState;

#[derive(Debug, Deserialize)]
pub struct UserScope {
    pub user_id: i64,
}

/// `POST /api/rotators`
///
/// Validation errors map to 400, name conflicts to 409, port exhaustion to
/// 503 and a missing user to 404, via the error's status mapping.
pub async fn create_rotator(
    State(state): State<AppState>,
    Json(payload): Json<CreateRotatorRequest>,
) -> Result<(StatusCode, Json<RotatorInfo>)> {
    let info = state.rotators.create(payload).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

/// `GET /api/rotators?user_id=`
pub async fn list_rotators(
    State(state): State<AppState>,
    Query(scope): Query<UserScope>,
) -> Result<Json<Vec<RotatorInfo>>> {
    let rotators = state.rotators.list(scope.user_id).await?;
    Ok(Json(rotators))
}

/// `DELETE /api/rotators/:id?user_id=`
pub async fn delete_rotator(
    State(state): State<AppState>,
    Path(rotator_id): Path<i64>,
    Query(scope): Query<UserScope>,
) -> Result<StatusCode> {
    state.rotators.delete(scope.user_id, rotator_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
