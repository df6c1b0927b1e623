use std::collections::HashMap;

use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;

use crate::error::Result;
use crate::models::{CheckUser, EstimatedType, Proxy, QueuedProxy};
use crate::security::SecretCipher;

/// Use a single statement below this row count
const BATCH_THRESHOLD: usize = 8191;
/// Conservative parameter ceiling (PostgreSQL's limit minus one)
const MAX_PARAMS_PER_BATCH: usize = 65534;
/// Minimum batch size to keep round trips worthwhile
const MIN_BATCH_SIZE: usize = 100;

/// Columns bound per proxy insert row
const PROXY_INSERT_FIELDS: usize = 7;

/// Repository for proxy rows and their user associations
#[derive(Clone)]
pub struct ProxyRepository {
    pool: PgPool,
    cipher: SecretCipher,
}

impl ProxyRepository {
    pub fn new(pool: PgPool, cipher: SecretCipher) -> Self {
        Self { pool, cipher }
    }

    /// Insert proxies deduplicated by hash and associate them with a user.
    ///
    /// Re-submitting an identical `(ip, port, username, password)` tuple
    /// reuses the existing row. Returns the stored proxies with their ids.
    pub async fn upsert_for_user(&self, proxies: &[Proxy], user_id: i64) -> Result<Vec<Proxy>> {
        // In-memory dedup first so ON CONFLICT never sees a batch-internal
        // duplicate.
        let mut unique: Vec<&Proxy> = Vec::with_capacity(proxies.len());
        let mut seen = std::collections::HashSet::new();
        for proxy in proxies {
            if seen.insert(proxy.dedup_hash()) {
                unique.push(proxy);
            }
        }

        if unique.is_empty() {
            return Ok(Vec::new());
        }

        // Encrypt up front so the insert loop is infallible.
        let mut encrypted = Vec::with_capacity(unique.len());
        for proxy in &unique {
            encrypted.push((
                self.cipher.encrypt(&proxy.ip)?,
                self.cipher.encrypt(&proxy.password)?,
                *proxy,
            ));
        }

        let batch_size = calculate_batch_size(unique.len(), PROXY_INSERT_FIELDS);
        let mut tx = self.pool.begin().await?;

        for chunk in encrypted.chunks(batch_size) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO proxies (ip, port, username, password, country, estimated_type, hash) ",
            );
            qb.push_values(chunk, |mut b, (ip, password, proxy)| {
                b.push_bind(ip.clone())
                    .push_bind(proxy.port as i32)
                    .push_bind(proxy.username.clone())
                    .push_bind(password.clone())
                    .push_bind(proxy.country.clone())
                    .push_bind(proxy.estimated_type.as_str())
                    .push_bind(proxy.dedup_hash().to_vec());
            });
            qb.push(" ON CONFLICT (hash) DO NOTHING");
            qb.build().execute(&mut *tx).await?;
        }

        // Resolve ids for the whole set, including pre-existing rows.
        let hashes: Vec<Vec<u8>> = unique.iter().map(|p| p.dedup_hash().to_vec()).collect();
        let rows = sqlx::query("SELECT id, hash FROM proxies WHERE hash = ANY($1)")
            .bind(&hashes)
            .fetch_all(&mut *tx)
            .await?;

        let mut id_by_hash: HashMap<Vec<u8>, i64> = HashMap::with_capacity(rows.len());
        for row in rows {
            id_by_hash.insert(row.get("hash"), row.get("id"));
        }

        let mut stored = Vec::with_capacity(unique.len());
        for proxy in unique {
            if let Some(&id) = id_by_hash.get(proxy.dedup_hash().as_slice()) {
                let mut with_id = proxy.clone();
                with_id.id = id;
                stored.push(with_id);
            }
        }

        let assoc_batch = calculate_batch_size(stored.len(), 2);
        for chunk in stored.chunks(assoc_batch) {
            let mut qb =
                QueryBuilder::<Postgres>::new("INSERT INTO user_proxies (user_id, proxy_id) ");
            qb.push_values(chunk, |mut b, proxy| {
                b.push_bind(user_id).push_bind(proxy.id);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        info!(count = stored.len(), user_id = user_id, "Stored proxies");
        Ok(stored)
    }

    /// Load every proxy together with its owners' check preferences, ready
    /// for enqueueing.
    pub async fn all_queued(&self) -> Result<Vec<QueuedProxy>> {
        let proxy_rows = sqlx::query(
            "SELECT id, ip, port, username, password, country, estimated_type FROM proxies ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let user_rows = sqlx::query(
            r#"
            SELECT up.proxy_id, u.id, u.http_protocol, u.https_protocol,
                   u.socks4_protocol, u.socks5_protocol, u.timeout_ms,
                   u.retries, u.use_https_for_socks
            FROM user_proxies up
            JOIN users u ON u.id = up.user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut users_by_proxy: HashMap<i64, Vec<CheckUser>> = HashMap::new();
        for row in user_rows {
            users_by_proxy
                .entry(row.get("proxy_id"))
                .or_default()
                .push(CheckUser {
                    id: row.get("id"),
                    http: row.get("http_protocol"),
                    https: row.get("https_protocol"),
                    socks4: row.get("socks4_protocol"),
                    socks5: row.get("socks5_protocol"),
                    timeout_ms: row.get::<i32, _>("timeout_ms") as u16,
                    retries: row.get::<i16, _>("retries") as u8,
                    use_https_for_socks: row.get("use_https_for_socks"),
                });
        }

        let mut queued = Vec::with_capacity(proxy_rows.len());
        for row in proxy_rows {
            let id: i64 = row.get("id");
            queued.push(QueuedProxy {
                proxy: Proxy {
                    id,
                    ip: self.cipher.decrypt(&row.get::<String, _>("ip"))?,
                    port: row.get::<i32, _>("port") as u16,
                    username: row.get("username"),
                    password: self.cipher.decrypt(&row.get::<String, _>("password"))?,
                    country: row.get("country"),
                    estimated_type: EstimatedType::from_str(&row.get::<String, _>("estimated_type")),
                },
                users: users_by_proxy.remove(&id).unwrap_or_default(),
            });
        }

        Ok(queued)
    }

    /// Refresh the owners carried in a queued record, dropping the proxy's
    /// queue entry implicitly when nobody references it anymore.
    pub async fn reload_owners(&self, proxy_id: i64) -> Result<Vec<CheckUser>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.http_protocol, u.https_protocol, u.socks4_protocol,
                   u.socks5_protocol, u.timeout_ms, u.retries, u.use_https_for_socks
            FROM user_proxies up
            JOIN users u ON u.id = up.user_id
            WHERE up.proxy_id = $1
            "#,
        )
        .bind(proxy_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| CheckUser {
                id: row.get("id"),
                http: row.get("http_protocol"),
                https: row.get("https_protocol"),
                socks4: row.get("socks4_protocol"),
                socks5: row.get("socks5_protocol"),
                timeout_ms: row.get::<i32, _>("timeout_ms") as u16,
                retries: row.get::<i16, _>("retries") as u8,
                use_https_for_socks: row.get("use_https_for_socks"),
            })
            .collect())
    }

    /// Delete proxies no user references anymore. Returns the removed count.
    pub async fn delete_orphans(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM proxies p
            WHERE NOT EXISTS (
                SELECT 1 FROM user_proxies up WHERE up.proxy_id = p.id
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Number of stored proxies
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM proxies")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Pick a batch size that keeps bound parameters under the driver limit.
///
/// Small batches go out as one statement; large ones are split so that
/// `batch * fields` stays below the parameter ceiling, but never below the
/// minimum worth a round trip.
pub(crate) fn calculate_batch_size(row_count: usize, fields: usize) -> usize {
    if row_count == 0 {
        return 1;
    }
    if row_count <= BATCH_THRESHOLD {
        return row_count;
    }

    let batch = MAX_PARAMS_PER_BATCH / fields.max(1);
    batch.clamp(MIN_BATCH_SIZE, row_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_small_counts_are_single_batch() {
        assert_eq!(calculate_batch_size(1, 7), 1);
        assert_eq!(calculate_batch_size(500, 7), 500);
        assert_eq!(calculate_batch_size(8191, 7), 8191);
    }

    #[test]
    fn test_batch_size_large_counts_respect_param_ceiling() {
        let batch = calculate_batch_size(100_000, 7);
        assert_eq!(batch, MAX_PARAMS_PER_BATCH / 7);
        assert!(batch * 7 <= MAX_PARAMS_PER_BATCH);
    }

    #[test]
    fn test_batch_size_clamps() {
        // Tiny row width cannot push the batch below the minimum
        assert!(calculate_batch_size(100_000, 65534) >= MIN_BATCH_SIZE);
        // Zero rows never panics
        assert_eq!(calculate_batch_size(0, 7), 1);
    }
}
