//! API route definitions

use axum::routing::{delete, get, post};
use axum::Router;

use super::handlers;
use super::server::AppState;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        // Rotating proxies
        .route("/api/rotators", post(handlers::rotator::create_rotator))
        .route("/api/rotators", get(handlers::rotator::list_rotators))
        .route(
            "/api/rotators/:id",
            delete(handlers::rotator::delete_rotator),
        )
        // Proxy submission
        .route("/api/proxies", post(handlers::proxy::submit_proxies))
        // Instance discovery for rotator placement
        .route("/api/instances", get(handlers::instance::list_instances))
        .with_state(state)
}
