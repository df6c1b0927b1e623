//! Checker worker
//!
//! Pops due proxies, probes them, records results and requeues. Result
//! write failures never prevent the requeue, and a worker only retires
//! between iterations, never mid-probe.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error};

use super::probe::probe;
use super::CheckerContext;

const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(3);

pub struct Worker {
    ctx: Arc<CheckerContext>,
    retires: Arc<AtomicU32>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        ctx: Arc<CheckerContext>,
        retires: Arc<AtomicU32>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            retires,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            if claim_retirement(&self.retires) {
                debug!("Checker worker retiring");
                return;
            }
            if *self.shutdown.borrow() {
                return;
            }

            match self.ctx.queue.pop_due(&mut self.shutdown).await {
                Ok(Some((mut queued, scheduled_time))) => {
                    // Owners can change while the proxy sat in the queue;
                    // refresh them, and let orphans leave the queue here.
                    match self.ctx.proxies.reload_owners(queued.proxy.id).await {
                        Ok(owners) => queued.users = owners,
                        Err(e) => {
                            debug!(proxy_id = queued.proxy.id, "Owner refresh failed: {}", e);
                        }
                    }
                    if queued.users.is_empty() {
                        debug!(
                            proxy_id = queued.proxy.id,
                            "Proxy has no owners; dropping from queue"
                        );
                        continue;
                    }

                    let stats = probe(&self.ctx, &queued).await;

                    if let Err(e) = self.ctx.statistics.record_batch(&stats).await {
                        error!(
                            proxy_id = queued.proxy.id,
                            "Failed to record statistics: {}", e
                        );
                    }

                    // Cadence is measured from the scheduled time; the
                    // requeue happens even when the result write failed.
                    if let Err(e) = self.ctx.queue.requeue(&queued, scheduled_time).await {
                        error!(proxy_id = queued.proxy.id, "Failed to requeue proxy: {}", e);
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    error!("Queue pop failed: {}", e);
                    tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Claim one pending retirement signal, if any. Each decrement retires
/// exactly one worker.
pub(crate) fn claim_retirement(retires: &AtomicU32) -> bool {
    retires
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_retirement_delivers_each_signal_once() {
        let retires = AtomicU32::new(2);

        assert!(claim_retirement(&retires));
        assert!(claim_retirement(&retires));
        assert!(!claim_retirement(&retires));
        assert_eq!(retires.load(Ordering::SeqCst), 0);
    }
}
