//! Orphan proxy sweep
//!
//! Proxies and users share a many-to-many association; this periodic job
//! deletes proxies no user references anymore.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::repository::ProxyRepository;

#[derive(Clone)]
pub struct OrphanSweepConfig {
    /// Interval between sweeps
    pub interval: Duration,
}

impl Default for OrphanSweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
        }
    }
}

pub struct OrphanSweepService {
    proxies: ProxyRepository,
    config: OrphanSweepConfig,
}

impl OrphanSweepService {
    pub fn new(proxies: ProxyRepository, config: OrphanSweepConfig) -> Self {
        Self { proxies, config }
    }

    /// Run the sweep loop (call in a spawned task). Sweeps once
    /// immediately, then on the configured interval.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting orphan proxy sweep"
        );

        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Orphan proxy sweep shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn sweep(&self) {
        match self.proxies.delete_orphans().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Orphan sweep removed proxies"),
            Err(e) => error!("Orphan sweep failed: {}", e),
        }
    }
}
