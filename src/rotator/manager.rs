//! Listener manager
//!
//! Per-instance singleton. Reconciles the running per-tenant servers
//! against the rotators leased to this instance: starts what is missing,
//! gracefully stops what is no longer desired.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::RotatorConfig;
use crate::models::RotatingProxy;
use crate::repository::RotatorRepository;

use super::server::RotatorServer;
use super::UpstreamSource;

pub struct ListenerManager {
    repo: RotatorRepository,
    source: Arc<dyn UpstreamSource>,
    ports: RotatorConfig,
    servers: Mutex<HashMap<i64, RotatorServer>>,
}

impl ListenerManager {
    pub fn new(
        repo: RotatorRepository,
        source: Arc<dyn UpstreamSource>,
        ports: RotatorConfig,
    ) -> Self {
        Self {
            repo,
            source,
            ports,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Run the reconcile loop (call in a spawned task). Reconciles
    /// immediately, then on every tick; stops every server on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.ports.reconcile_secs,
            "Starting rotator listener manager"
        );

        self.reconcile().await;

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.ports.reconcile_secs.max(1)));
        interval.tick().await; // immediate tick already consumed by the initial reconcile

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reconcile().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop_all().await;
        info!("Rotator listener manager stopped");
    }

    /// One reconcile pass: desired = this instance's rotators with a port
    /// inside the configured range.
    pub async fn reconcile(&self) {
        let rotators = match self.repo.for_instance().await {
            Ok(rotators) => rotators,
            Err(e) => {
                error!("Failed to load rotators: {}", e);
                return;
            }
        };

        let mut desired: HashMap<i64, RotatingProxy> = HashMap::new();
        for rotator in rotators {
            if rotator.listen_port == 0 || !self.ports.contains_port(rotator.listen_port) {
                warn!(
                    rotator_id = rotator.id,
                    listen_port = rotator.listen_port,
                    "Skipping rotator without valid port"
                );
                continue;
            }
            desired.insert(rotator.id, rotator);
        }

        // Stop servers that are no longer desired.
        let to_stop: Vec<RotatorServer> = {
            let mut servers = self.servers.lock().await;
            let ids: Vec<i64> = servers
                .keys()
                .copied()
                .filter(|id| !desired.contains_key(id))
                .collect();
            ids.into_iter().filter_map(|id| servers.remove(&id)).collect()
        };
        for server in to_stop {
            server.stop().await;
        }

        // Start servers for rotators not yet running. A bind failure is
        // logged and the rotator skipped; it never crashes the process.
        for (id, rotator) in desired {
            if self.servers.lock().await.contains_key(&id) {
                continue;
            }

            match RotatorServer::start(rotator, self.source.clone()).await {
                Ok(server) => {
                    self.servers.lock().await.insert(id, server);
                }
                Err(e) => {
                    error!(rotator_id = id, "Failed to start rotator server: {}", e);
                }
            }
        }
    }

    /// Number of currently running servers
    pub async fn running_count(&self) -> usize {
        self.servers.lock().await.len()
    }

    async fn stop_all(&self) {
        let servers: Vec<RotatorServer> = {
            let mut guard = self.servers.lock().await;
            guard.drain().map(|(_, server)| server).collect()
        };

        for server in servers {
            server.stop().await;
        }
    }
}
