//! Checker dispatcher
//!
//! Reconciles the worker pool every 15 s. With dynamic sizing the target is
//! derived from queue depth, cluster size and check timing; otherwise a
//! fixed count is used. Growth spawns tasks, shrink posts one retirement
//! signal per worker to retire.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::worker::Worker;
use super::CheckerContext;

const DISPATCH_INTERVAL: Duration = Duration::from_secs(15);
const FALLBACK_PERIOD_MS: u128 = 86_400_000;
/// Protocols every proxy is probed over
const PROTOCOL_COUNT: u128 = 4;

pub struct CheckerDispatcher {
    ctx: Arc<CheckerContext>,
    retires: Arc<AtomicU32>,
    active: u32,
}

impl CheckerDispatcher {
    pub fn new(ctx: Arc<CheckerContext>) -> Self {
        Self {
            ctx,
            retires: Arc::new(AtomicU32::new(0)),
            active: 0,
        }
    }

    /// Run the dispatcher (call in a spawned task). Workers inherit the
    /// shutdown receiver and drain cooperatively when it fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting checker dispatcher");
        let mut interval = tokio::time::interval(DISPATCH_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reconcile(&shutdown).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Checker dispatcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn reconcile(&mut self, shutdown: &watch::Receiver<bool>) {
        let target = if self.ctx.config.dynamic_workers {
            self.auto_target().await
        } else {
            self.ctx.config.workers.max(1)
        };

        while self.active < target {
            let worker = Worker::new(self.ctx.clone(), self.retires.clone(), shutdown.clone());
            tokio::spawn(worker.run());
            self.active += 1;
        }

        while self.active > target {
            self.retires.fetch_add(1, Ordering::SeqCst);
            self.active -= 1;
        }

        debug!(active = self.active, "Checker workers reconciled");
    }

    async fn auto_target(&self) -> u32 {
        let total_proxies = match self.ctx.queue.size().await {
            Ok(count) => count,
            Err(e) => {
                error!("Failed to get proxy count: {}", e);
                return 1;
            }
        };

        let active_instances = match self.ctx.queue.active_instances().await {
            Ok(count) => count,
            Err(e) => {
                error!("Failed to get active instances: {}", e);
                1
            }
        };

        required_workers(
            total_proxies,
            active_instances,
            self.ctx.config.retries,
            self.ctx.config.timeout_ms,
            self.ctx.config.period_secs * 1000,
        )
    }
}

/// Workers needed so queue drain matches the checking period:
/// `ceil(per_instance_proxies * protocols * (retries + 1) * timeout / period)`,
/// clamped to `[1, u32::MAX]`. A zero period counts as one day.
pub fn required_workers(
    total_proxies: i64,
    active_instances: usize,
    retries: u8,
    timeout_ms: u64,
    period_ms: u64,
) -> u32 {
    let instances = active_instances.max(1) as i64;
    let total = total_proxies.max(0);
    let per_instance = ((total + instances - 1) / instances) as u128;

    let period = if period_ms == 0 {
        FALLBACK_PERIOD_MS
    } else {
        period_ms as u128
    };

    let numerator = per_instance * PROTOCOL_COUNT * (retries as u128 + 1) * timeout_ms as u128;
    let required = numerator.div_ceil(period);

    required.clamp(1, u32::MAX as u128) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_workers_meets_drain_rate() {
        // 10_000 proxies, 1 instance, 2 retries, 7500 ms timeout, 1 h period
        let workers = required_workers(10_000, 1, 2, 7500, 3_600_000);

        let numerator = 10_000u128 * 4 * 3 * 7500;
        let expected = numerator.div_ceil(3_600_000);
        assert_eq!(workers as u128, expected);
        assert!(workers as u128 >= numerator / 3_600_000);
    }

    #[test]
    fn test_required_workers_splits_across_instances() {
        let solo = required_workers(10_000, 1, 2, 7500, 3_600_000);
        let split = required_workers(10_000, 4, 2, 7500, 3_600_000);
        assert!(split < solo);

        // Per-instance share is the ceiling, so 3 instances over 10 proxies
        // size for 4 each.
        assert_eq!(
            required_workers(10, 3, 0, 1000, 1000),
            required_workers(4, 1, 0, 1000, 1000)
        );
    }

    #[test]
    fn test_required_workers_clamps_low() {
        assert_eq!(required_workers(0, 1, 2, 7500, 3_600_000), 1);
        assert_eq!(required_workers(1, 1, 0, 1, 86_400_000), 1);
    }

    #[test]
    fn test_required_workers_clamps_high() {
        let workers = required_workers(i64::MAX, 1, 255, u64::MAX, 1);
        assert_eq!(workers, u32::MAX);
    }

    #[test]
    fn test_required_workers_zero_period_is_one_day() {
        assert_eq!(
            required_workers(10_000, 1, 2, 7500, 0),
            required_workers(10_000, 1, 2, 7500, 86_400_000)
        );
    }
}
