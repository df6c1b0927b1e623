//! Proxy submission glue
//!
//! Parses a free-text proxy list, upserts by hash, associates with the
//! submitting user and enqueues the new proxies for checking.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MagpieError, Result};
use crate::models::{parse_proxy_list, QueuedProxy};

use super::super::server::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitProxiesRequest {
    pub user_id: i64,
    /// Free-text proxy list, one entry per line
    pub proxies: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitProxiesResponse {
    pub parsed: usize,
    pub stored: usize,
}

/// `POST /api/proxies`
pub async fn submit_proxies(
    State(state): State<AppState>,
    Json(payload): Json<SubmitProxiesRequest>,
) -> Result<(StatusCode, Json<SubmitProxiesResponse>)> {
    let user = state
        .users
        .get_by_id(payload.user_id)
        .await?
        .ok_or(MagpieError::UserNotFound(payload.user_id))?;

    let parsed = parse_proxy_list(&payload.proxies);
    if parsed.is_empty() {
        return Err(MagpieError::Validation(
            "no valid proxies in submission".into(),
        ));
    }

    let stored = state.proxies.upsert_for_user(&parsed, user.id).await?;

    let prefs = user.check_prefs();
    let queued: Vec<QueuedProxy> = stored
        .iter()
        .map(|proxy| QueuedProxy {
            proxy: proxy.clone(),
            users: vec![prefs.clone()],
        })
        .collect();
    state.queue.enqueue(&queued).await?;

    info!(
        user_id = user.id,
        parsed = parsed.len(),
        stored = stored.len(),
        "Accepted proxy submission"
    );

    Ok((
        StatusCode::CREATED,
        Json(SubmitProxiesResponse {
            parsed: parsed.len(),
            stored: stored.len(),
        }),
    ))
}
