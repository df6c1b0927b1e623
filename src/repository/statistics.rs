use std::collections::HashMap;

use chrono::Utc;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::instrument;

use crate::error::Result;
use crate::models::{Protocol, ProxyLatestStatistic, ProxyStatistic};

use super::proxy::calculate_batch_size;

/// Columns bound per statistic insert row
const STATISTIC_INSERT_FIELDS: usize = 10;

/// Writer for check results and the materialized status tables.
///
/// This is the only strictly serializable write path in the system: the
/// statistic inserts, the latest-row upserts and the overall-status upserts
/// commit in one transaction, in that order.
#[derive(Clone)]
pub struct StatisticsRepository {
    pool: PgPool,
}

impl StatisticsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a batch of check results and refresh the materialized rows.
    #[instrument(skip(self, stats), fields(count = stats.len()))]
    pub async fn record_batch(&self, stats: &[ProxyStatistic]) -> Result<()> {
        if stats.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        // 1. Append the raw events, collecting their assigned ids in order.
        let mut ids = Vec::with_capacity(stats.len());
        let batch_size = calculate_batch_size(stats.len(), STATISTIC_INSERT_FIELDS);
        for chunk in stats.chunks(batch_size) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO proxy_statistics \
                 (proxy_id, protocol_id, judge_id, alive, response_time_ms, attempt, \
                  level_id, country, estimated_type, created_at) ",
            );
            qb.push_values(chunk, |mut b, stat| {
                b.push_bind(stat.proxy_id)
                    .push_bind(stat.protocol.id())
                    .push_bind(stat.judge_id)
                    .push_bind(stat.alive)
                    .push_bind(stat.response_time_ms)
                    .push_bind(stat.attempt)
                    .push_bind(stat.level.map(|l| l.id()))
                    .push_bind(stat.country.clone())
                    .push_bind(stat.estimated_type.as_str())
                    .push_bind(stat.created_at);
            });
            qb.push(" RETURNING id");
            let chunk_ids: Vec<i64> = qb.build_query_scalar().fetch_all(&mut *tx).await?;
            ids.extend(chunk_ids);
        }

        // 2. Reduce the batch to one candidate row per (proxy, protocol) and
        //    upsert under the monotonicity condition.
        let latest = latest_entries(stats, &ids);
        if !latest.is_empty() {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO proxy_latest_statistics \
                 (proxy_id, protocol_id, alive, statistic_id, checked_at) ",
            );
            qb.push_values(latest.iter(), |mut b, entry| {
                b.push_bind(entry.proxy_id)
                    .push_bind(entry.protocol.id())
                    .push_bind(entry.alive)
                    .push_bind(entry.statistic_id)
                    .push_bind(entry.checked_at);
            });
            qb.push(
                " ON CONFLICT (proxy_id, protocol_id) DO UPDATE SET \
                 alive = excluded.alive, \
                 statistic_id = excluded.statistic_id, \
                 checked_at = excluded.checked_at, \
                 updated_at = CURRENT_TIMESTAMP \
                 WHERE excluded.checked_at > proxy_latest_statistics.checked_at OR \
                 (excluded.checked_at = proxy_latest_statistics.checked_at AND \
                  excluded.statistic_id > proxy_latest_statistics.statistic_id)",
            );
            qb.build().execute(&mut *tx).await?;
        }

        // 3. Recompute the per-proxy rollup for every touched proxy.
        let mut proxy_ids: Vec<i64> = latest.iter().map(|e| e.proxy_id).collect();
        proxy_ids.sort_unstable();
        proxy_ids.dedup();

        if !proxy_ids.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO proxy_overall_statuses (proxy_id, overall_alive, last_checked_at)
                SELECT
                    pls.proxy_id,
                    BOOL_OR(pls.alive) AS overall_alive,
                    MAX(pls.checked_at) AS last_checked_at
                FROM proxy_latest_statistics pls
                WHERE pls.proxy_id = ANY($1)
                GROUP BY pls.proxy_id
                ON CONFLICT (proxy_id) DO UPDATE
                SET overall_alive = excluded.overall_alive,
                    last_checked_at = excluded.last_checked_at,
                    updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(&proxy_ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Per-proxy uptime for a protocol: `round1(100 * alive / total)` over
    /// all historical statistics. The same quantization the rotator filters
    /// apply to their thresholds.
    pub async fn uptime_for_protocol(
        &self,
        proxy_id: i64,
        protocol: Protocol,
    ) -> Result<Option<f64>> {
        let uptime = sqlx::query_scalar::<_, Option<f64>>(
            r#"
            SELECT ROUND(
                100.0 * SUM(CASE WHEN alive THEN 1 ELSE 0 END) / NULLIF(COUNT(*), 0),
                1
            )::FLOAT8
            FROM proxy_statistics
            WHERE proxy_id = $1 AND protocol_id = $2
            "#,
        )
        .bind(proxy_id)
        .bind(protocol.id())
        .fetch_one(&self.pool)
        .await?;

        Ok(uptime)
    }
}

/// Reduce a statistic batch to the newest candidate per `(proxy, protocol)`
/// by `(checked_at, statistic_id)` order. `ids` are the database ids
/// assigned to `stats`, index-aligned.
fn latest_entries(stats: &[ProxyStatistic], ids: &[i64]) -> Vec<ProxyLatestStatistic> {
    let now = Utc::now();
    let mut latest: HashMap<(i64, Protocol), ProxyLatestStatistic> =
        HashMap::with_capacity(stats.len());

    for (idx, stat) in stats.iter().enumerate() {
        if stat.proxy_id == 0 {
            continue;
        }
        let statistic_id = match ids.get(idx) {
            Some(&id) => id,
            None => continue,
        };

        let checked_at = if stat.created_at.timestamp() == 0 {
            now
        } else {
            stat.created_at
        };

        let entry = ProxyLatestStatistic {
            proxy_id: stat.proxy_id,
            protocol: stat.protocol,
            alive: stat.alive,
            statistic_id,
            checked_at,
        };

        match latest.entry((stat.proxy_id, stat.protocol)) {
            std::collections::hash_map::Entry::Occupied(mut existing) => {
                if entry.is_newer_than(existing.get()) {
                    existing.insert(entry);
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
    }

    let mut entries: Vec<ProxyLatestStatistic> = latest.into_values().collect();
    entries.sort_unstable_by_key(|e| (e.proxy_id, e.protocol.id()));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnonymityLevel, EstimatedType};
    use chrono::TimeZone;

    fn stat(proxy_id: i64, protocol: Protocol, alive: bool, secs: i64) -> ProxyStatistic {
        ProxyStatistic {
            id: 0,
            proxy_id,
            protocol,
            judge_id: 1,
            alive,
            response_time_ms: 120,
            attempt: 0,
            level: alive.then_some(AnonymityLevel::Elite),
            country: String::new(),
            estimated_type: EstimatedType::Unknown,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_latest_entries_keeps_newest_per_key() {
        let stats = vec![
            stat(1, Protocol::Http, false, 100),
            stat(1, Protocol::Http, true, 200),
            stat(1, Protocol::Socks5, true, 150),
            stat(2, Protocol::Http, false, 300),
        ];
        let ids = vec![10, 11, 12, 13];

        let latest = latest_entries(&stats, &ids);
        assert_eq!(latest.len(), 3);

        let http_1 = latest
            .iter()
            .find(|e| e.proxy_id == 1 && e.protocol == Protocol::Http)
            .unwrap();
        assert!(http_1.alive);
        assert_eq!(http_1.statistic_id, 11);

        let socks_1 = latest
            .iter()
            .find(|e| e.proxy_id == 1 && e.protocol == Protocol::Socks5)
            .unwrap();
        assert_eq!(socks_1.statistic_id, 12);
    }

    #[test]
    fn test_latest_entries_equal_timestamps_break_by_id() {
        let stats = vec![
            stat(1, Protocol::Http, true, 100),
            stat(1, Protocol::Http, false, 100),
        ];
        let ids = vec![20, 21];

        let latest = latest_entries(&stats, &ids);
        assert_eq!(latest.len(), 1);
        // The higher statistic id wins the tie, regardless of batch order.
        assert_eq!(latest[0].statistic_id, 21);
        assert!(!latest[0].alive);
    }

    #[test]
    fn test_latest_entries_order_independent() {
        let forward = vec![
            stat(1, Protocol::Http, false, 100),
            stat(1, Protocol::Http, true, 200),
        ];
        let backward = vec![
            stat(1, Protocol::Http, true, 200),
            stat(1, Protocol::Http, false, 100),
        ];

        let a = latest_entries(&forward, &[1, 2]);
        let b = latest_entries(&backward, &[2, 1]);

        assert_eq!(a[0].statistic_id, 2);
        assert_eq!(b[0].statistic_id, 2);
        assert_eq!(a[0].alive, b[0].alive);
    }

    #[test]
    fn test_latest_entries_skips_unassigned_rows() {
        let stats = vec![stat(0, Protocol::Http, true, 100)];
        assert!(latest_entries(&stats, &[1]).is_empty());

        let stats = vec![stat(1, Protocol::Http, true, 100)];
        assert!(latest_entries(&stats, &[]).is_empty());
    }
}
