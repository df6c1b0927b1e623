//! Cluster-shared time-ordered proxy queue
//!
//! A Redis sorted set scored by scheduled check time (unix seconds), with a
//! companion keyspace holding the serialized proxy record per hash. The pop
//! is a server-side script so exactly one worker holds a proxy in flight.

pub mod heartbeat;

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::QueuedProxy;

const PROXY_KEY_PREFIX: &str = "proxy:";
const QUEUE_KEY: &str = "proxy_queue";
const EMPTY_QUEUE_SLEEP: Duration = Duration::from_secs(1);
/// Logical entries per pipeline; each entry is a SET plus a ZADD
const PIPELINE_BATCH: usize = 500;

/// Atomic pop of the lowest-scored due entry together with its record.
///
/// `POP(queueKey, proxyKeyPrefix, now) -> [hash, proxyJSON, score]` or nil.
const POP_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due == 0 then
    return nil
end
local hash = due[1]
local proxy_key = KEYS[2] .. hash
local payload = redis.call('GET', proxy_key)
local score = redis.call('ZSCORE', KEYS[1], hash)
redis.call('ZREM', KEYS[1], hash)
redis.call('DEL', proxy_key)
if not payload then
    return nil
end
return {hash, payload, tonumber(score)}
"#;

/// The shared proxy check queue
#[derive(Clone)]
pub struct ProxyQueue {
    conn: ConnectionManager,
    pop_script: Script,
    period: Duration,
}

impl ProxyQueue {
    /// Connect to the queue backing store. Failure here is fatal at startup.
    pub async fn connect(redis_url: &str, period: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            pop_script: Script::new(POP_SCRIPT),
            period,
        })
    }

    /// Wrap an existing connection (used by tests)
    pub fn with_connection(conn: ConnectionManager, period: Duration) -> Self {
        Self {
            conn,
            pop_script: Script::new(POP_SCRIPT),
            period,
        }
    }

    /// Insert proxies smeared across one checking period so a bulk import
    /// does not produce a thundering herd of due checks.
    pub async fn enqueue(&self, proxies: &[QueuedProxy]) -> Result<()> {
        if proxies.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp();
        let total = proxies.len() as u64;

        for (chunk_idx, chunk) in proxies.chunks(PIPELINE_BATCH).enumerate() {
            let mut pipe = redis::pipe();
            for (i, queued) in chunk.iter().enumerate() {
                let position = (chunk_idx * PIPELINE_BATCH + i) as u64;
                let offset_secs = smear_offset_secs(self.period.as_secs(), position, total);
                let score = now + offset_secs as i64;

                let hash = queued.proxy.hash_hex();
                let payload = serde_json::to_string(queued)
                    .map_err(|e| crate::error::MagpieError::Internal(e.to_string()))?;

                pipe.set(format!("{}{}", PROXY_KEY_PREFIX, hash), payload)
                    .ignore();
                pipe.zadd(QUEUE_KEY, hash, score).ignore();
            }
            pipe.query_async::<()>(&mut conn).await?;
        }

        debug!(count = proxies.len(), "Enqueued proxies");
        Ok(())
    }

    /// Pop the next due proxy, blocking in 1 s intervals while the queue has
    /// nothing due. Returns `None` when shutdown is signalled.
    pub async fn pop_due(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<(QueuedProxy, DateTime<Utc>)>> {
        let mut conn = self.conn.clone();

        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            let now = Utc::now().timestamp();
            let popped: Option<(String, String, i64)> = self
                .pop_script
                .key(QUEUE_KEY)
                .key(PROXY_KEY_PREFIX)
                .arg(now)
                .invoke_async(&mut conn)
                .await?;

            match popped {
                Some((_hash, payload, score)) => {
                    let queued: QueuedProxy = match serde_json::from_str(&payload) {
                        Ok(q) => q,
                        Err(e) => {
                            warn!("Dropping undecodable queue record: {}", e);
                            continue;
                        }
                    };
                    let scheduled = Utc
                        .timestamp_opt(score, 0)
                        .single()
                        .unwrap_or_else(Utc::now);
                    return Ok(Some((queued, scheduled)));
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(EMPTY_QUEUE_SLEEP) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return Ok(None);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Requeue a proxy with cadence measured from its scheduled time, not
    /// the actual finish time, so drift stays bounded.
    pub async fn requeue(
        &self,
        queued: &QueuedProxy,
        scheduled_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();

        let next_check = next_check_ts(scheduled_time.timestamp(), self.period.as_secs());
        let hash = queued.proxy.hash_hex();
        let payload = serde_json::to_string(queued)
            .map_err(|e| crate::error::MagpieError::Internal(e.to_string()))?;

        let mut pipe = redis::pipe();
        pipe.set(format!("{}{}", PROXY_KEY_PREFIX, hash), payload)
            .ignore();
        pipe.zadd(QUEUE_KEY, hash, next_check).ignore();
        pipe.query_async::<()>(&mut conn).await?;

        Ok(())
    }

    /// Number of queued proxies
    pub async fn size(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("ZCARD")
            .arg(QUEUE_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    /// Count of instances with a live heartbeat
    pub async fn active_instances(&self) -> Result<usize> {
        heartbeat::count_active_instances(&mut self.conn.clone()).await
    }

    /// Instances with a live heartbeat, payloads repaired from the given
    /// fallback port range where partial
    pub async fn list_instances(
        &self,
        fallback_port_start: u16,
        fallback_port_end: u16,
    ) -> Result<Vec<crate::models::ActiveInstance>> {
        heartbeat::list_active_instances(
            &mut self.conn.clone(),
            fallback_port_start,
            fallback_port_end,
        )
        .await
    }
}

/// Smear offset for the i-th of n proxies across one period
pub(crate) fn smear_offset_secs(period_secs: u64, index: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (period_secs * index) / total
}

/// Next check time measured from the scheduled time, not the finish time
pub(crate) fn next_check_ts(scheduled_secs: i64, period_secs: u64) -> i64 {
    scheduled_secs + period_secs as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smear_spreads_batch_across_period() {
        let period = 3600;
        let total = 6;

        let offsets: Vec<u64> = (0..total)
            .map(|i| smear_offset_secs(period, i, total))
            .collect();

        assert_eq!(offsets, vec![0, 600, 1200, 1800, 2400, 3000]);
        assert!(offsets.iter().all(|&o| o < period));
    }

    #[test]
    fn test_smear_single_proxy_is_due_now() {
        assert_eq!(smear_offset_secs(3600, 0, 1), 0);
        assert_eq!(smear_offset_secs(3600, 0, 0), 0);
    }

    #[test]
    fn test_requeue_cadence_is_drift_free() {
        // Two requeues after scheduled times t and t+P land at t+P and t+2P,
        // independent of when the checks actually finished.
        let period = 600u64;
        let t = 1_700_000_000i64;

        let first_next = next_check_ts(t, period);
        let second_next = next_check_ts(first_next, period);

        assert_eq!(first_next, t + 600);
        assert_eq!(second_next, t + 1200);
    }
}
