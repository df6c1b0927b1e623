//! Control-plane API server using Axum
//!
//! Exposes the rotator management surface and proxy submission glue toward
//! the external control plane.

use std::net::SocketAddr;
use std::time::Instant;

use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::{ApiServerConfig, RotatorConfig};
use crate::database::Database;
use crate::error::Result;
use crate::queue::ProxyQueue;
use crate::repository::{ProxyRepository, RotatorRepository, UserRepository};

use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub rotators: RotatorRepository,
    pub proxies: ProxyRepository,
    pub users: UserRepository,
    pub queue: ProxyQueue,
    pub rotator_ports: RotatorConfig,
    pub started_at: Instant,
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(
        config: ApiServerConfig,
        db: Database,
        rotators: RotatorRepository,
        proxies: ProxyRepository,
        users: UserRepository,
        queue: ProxyQueue,
        rotator_ports: RotatorConfig,
    ) -> Self {
        let state = AppState {
            db,
            rotators,
            proxies,
            users,
            queue,
            rotator_ports,
            started_at: Instant::now(),
        };

        Self { config, state }
    }

    fn build_router(&self) -> Router {
        routes::create_router(self.state.clone()).layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|_| {
                crate::error::MagpieError::InvalidConfig("invalid API server address".into())
            })?;

        let router = self.build_router();

        info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| crate::error::MagpieError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
