use rand::seq::SliceRandom;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{info, instrument};

use crate::config::{InstanceConfig, RotatorConfig};
use crate::error::{MagpieError, Result};
use crate::models::{
    reputation_filter_applies, sanitize_reputation_labels, select_next_proxy_id,
    CreateRotatorRequest, Protocol, ReputationLabel, RotatingProxy, RotatorInfo, RotatorNext,
    TransportProtocol, UptimeFilter, UptimeFilterKind, ROTATOR_NAME_MAX_LENGTH,
    REPUTATION_KIND_OVERALL,
};
use crate::security::SecretCipher;

const ROTATOR_COLUMNS: &str = "id, user_id, name, instance_id, instance_name, instance_region, \
     protocol_id, listen_protocol_id, transport_protocol, listen_transport_protocol, \
     uptime_filter_type, uptime_percentage::FLOAT8 AS uptime_percentage, listen_port, \
     auth_required, auth_username, auth_password, reputation_labels, last_proxy_id, \
     last_rotation_at, created_at";

/// A proxy eligible for rotation, secrets still encrypted
struct EligibleProxy {
    id: i64,
    ip: String,
    port: u16,
    username: String,
    password: String,
}

/// Repository for rotating proxy listeners: creation with port lease,
/// listing, and the per-connection rotation selection.
#[derive(Clone)]
pub struct RotatorRepository {
    pool: PgPool,
    cipher: SecretCipher,
    instance: InstanceConfig,
    ports: RotatorConfig,
}

impl RotatorRepository {
    pub fn new(
        pool: PgPool,
        cipher: SecretCipher,
        instance: InstanceConfig,
        ports: RotatorConfig,
    ) -> Self {
        Self {
            pool,
            cipher,
            instance,
            ports,
        }
    }

    /// Create a rotator for a user, leasing a free port on the target
    /// instance.
    #[instrument(skip(self, req), fields(user_id = req.user_id, name = %req.name))]
    pub async fn create(&self, req: CreateRotatorRequest) -> Result<RotatorInfo> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(MagpieError::Validation(
                "rotating proxy name is required".into(),
            ));
        }
        if name.len() > ROTATOR_NAME_MAX_LENGTH {
            return Err(MagpieError::Validation(
                "rotating proxy name is too long".into(),
            ));
        }

        let protocol = Protocol::from_str(&req.protocol).ok_or_else(|| {
            MagpieError::Validation("rotating proxy protocol is required".into())
        })?;
        let listen_protocol = match req.listen_protocol.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Protocol::from_str(raw).ok_or_else(|| {
                MagpieError::Validation("unknown listen protocol".into())
            })?,
            _ => protocol,
        };

        let transport =
            TransportProtocol::normalize(req.transport_protocol.as_deref().unwrap_or(""));
        let listen_transport = match req.listen_transport_protocol.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => TransportProtocol::normalize(raw),
            _ => transport,
        };

        if listen_protocol.is_socks() && listen_transport.is_quic_based() {
            return Err(MagpieError::Validation(
                "socks rotators require tcp transport".into(),
            ));
        }

        let auth_username = req.auth_username.unwrap_or_default().trim().to_string();
        let auth_password = req.auth_password.unwrap_or_default();
        if req.auth_required {
            if auth_username.is_empty() {
                return Err(MagpieError::Validation(
                    "authentication username is required when authentication is enabled".into(),
                ));
            }
            if auth_password.trim().is_empty() {
                return Err(MagpieError::Validation(
                    "authentication password is required when authentication is enabled".into(),
                ));
            }
        }

        let uptime_filter =
            UptimeFilter::validate(req.uptime_filter_type.as_deref(), req.uptime_percentage)?;
        let labels = sanitize_reputation_labels(&req.reputation_labels);

        let instance_id = match req.instance_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => self.instance.id.clone(),
        };

        let mut tx = self.pool.begin().await?;

        let user_exists =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE id = $1")
                .bind(req.user_id)
                .fetch_one(&mut *tx)
                .await?;
        if user_exists == 0 {
            return Err(MagpieError::UserNotFound(req.user_id));
        }

        let listen_port = self.allocate_port(&mut tx, &instance_id).await?;

        let label_json = serde_json::to_value(
            labels.iter().map(|l| l.as_str()).collect::<Vec<_>>(),
        )
        .map_err(|e| MagpieError::Internal(e.to_string()))?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO rotating_proxies
                (user_id, name, instance_id, instance_name, instance_region,
                 protocol_id, listen_protocol_id, transport_protocol,
                 listen_transport_protocol, uptime_filter_type, uptime_percentage,
                 listen_port, auth_required, auth_username, auth_password,
                 reputation_labels)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {ROTATOR_COLUMNS}
            "#,
        ))
        .bind(req.user_id)
        .bind(&name)
        .bind(&instance_id)
        .bind(&self.instance.name)
        .bind(&self.instance.region)
        .bind(protocol.id())
        .bind(listen_protocol.id())
        .bind(transport.as_str())
        .bind(listen_transport.as_str())
        .bind(uptime_filter.map(|f| f.kind.as_str()).unwrap_or(""))
        .bind(uptime_filter.map(|f| f.percentage))
        .bind(listen_port as i32)
        .bind(req.auth_required)
        .bind(&auth_username)
        .bind(self.cipher.encrypt(&auth_password)?)
        .bind(label_json)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_unique_violation)?;

        let rotator = self.row_to_rotator(&row)?;
        let alive = self
            .eligible_proxies(&mut tx, req.user_id, protocol, &labels, uptime_filter)
            .await?;

        tx.commit().await?;

        info!(
            rotator_id = rotator.id,
            listen_port = rotator.listen_port,
            "Created rotating proxy"
        );

        Ok(rotator_info(&rotator, alive.len()))
    }

    /// List a user's rotators with their current alive counts
    pub async fn list(&self, user_id: i64) -> Result<Vec<RotatorInfo>> {
        let rows = sqlx::query(&format!(
            "SELECT {ROTATOR_COLUMNS} FROM rotating_proxies \
             WHERE user_id = $1 ORDER BY created_at DESC",
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let rotator = self.row_to_rotator(&row)?;
            let mut tx = self.pool.begin().await?;
            let alive = self
                .eligible_proxies(
                    &mut tx,
                    user_id,
                    rotator.protocol,
                    &rotator.reputation_labels,
                    rotator.uptime_filter,
                )
                .await?;
            tx.commit().await?;
            result.push(rotator_info(&rotator, alive.len()));
        }

        Ok(result)
    }

    /// Delete a user's rotator
    pub async fn delete(&self, user_id: i64, rotator_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM rotating_proxies WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(rotator_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MagpieError::RotatorNotFound);
        }
        Ok(())
    }

    /// Rotators leased to this instance, the listener manager's desired set
    pub async fn for_instance(&self) -> Result<Vec<RotatingProxy>> {
        let rows = sqlx::query(&format!(
            "SELECT {ROTATOR_COLUMNS} FROM rotating_proxies \
             WHERE instance_id = $1 ORDER BY created_at ASC",
        ))
        .bind(&self.instance.id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| self.row_to_rotator(row)).collect()
    }

    /// Select the next upstream proxy for one inbound connection.
    ///
    /// The rotator row is taken under `FOR UPDATE`, so concurrent callers to
    /// the same rotator observe a total order and the fairness guarantee
    /// holds.
    #[instrument(skip(self))]
    pub async fn next_proxy(&self, user_id: i64, rotator_id: i64) -> Result<RotatorNext> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {ROTATOR_COLUMNS} FROM rotating_proxies \
             WHERE user_id = $1 AND id = $2 FOR UPDATE",
        ))
        .bind(user_id)
        .bind(rotator_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(MagpieError::RotatorNotFound)?;

        let rotator = self.row_to_rotator(&row)?;

        let eligible = self
            .eligible_proxies(
                &mut tx,
                user_id,
                rotator.protocol,
                &rotator.reputation_labels,
                rotator.uptime_filter,
            )
            .await?;

        let ids: Vec<i64> = eligible.iter().map(|p| p.id).collect();
        let selected_id =
            select_next_proxy_id(&ids, rotator.last_proxy_id).ok_or(MagpieError::NoAliveProxies)?;
        let selected = eligible
            .iter()
            .find(|p| p.id == selected_id)
            .ok_or_else(|| MagpieError::Internal("selected proxy vanished from set".into()))?;

        sqlx::query(
            "UPDATE rotating_proxies \
             SET last_proxy_id = $1, last_rotation_at = NOW(), updated_at = NOW() \
             WHERE id = $2",
        )
        .bind(selected.id)
        .bind(rotator.id)
        .execute(&mut *tx)
        .await?;

        let next = RotatorNext {
            proxy_id: selected.id,
            ip: self.cipher.decrypt(&selected.ip)?,
            port: selected.port,
            username: selected.username.clone(),
            password: self.cipher.decrypt(&selected.password)?,
            has_auth: !selected.username.is_empty() && !selected.password.is_empty(),
            protocol: rotator.protocol,
        };

        tx.commit().await?;
        Ok(next)
    }

    /// The eligible set: proxies owned by the user, alive for the protocol
    /// in their latest check, passing reputation and uptime filters, in
    /// canonical `proxy_id` order.
    async fn eligible_proxies(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: i64,
        protocol: Protocol,
        labels: &[ReputationLabel],
        uptime_filter: Option<UptimeFilter>,
    ) -> Result<Vec<EligibleProxy>> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT p.id, p.ip, p.port, p.username, p.password \
             FROM proxies p \
             JOIN user_proxies up ON up.proxy_id = p.id AND up.user_id = ",
        );
        qb.push_bind(user_id);
        qb.push(
            " JOIN proxy_latest_statistics pls ON pls.proxy_id = p.id \
             AND pls.alive = TRUE AND pls.protocol_id = ",
        );
        qb.push_bind(protocol.id());

        if reputation_filter_applies(labels) {
            let label_strings: Vec<String> =
                labels.iter().map(|l| l.as_str().to_string()).collect();
            qb.push(" JOIN proxy_reputations pr ON pr.proxy_id = p.id AND pr.kind = ");
            qb.push_bind(REPUTATION_KIND_OVERALL);
            qb.push(" AND pr.label = ANY(");
            qb.push_bind(label_strings);
            qb.push(")");
        }

        if let Some(filter) = uptime_filter {
            qb.push(
                " JOIN (SELECT proxy_id, \
                 ROUND(100.0 * SUM(CASE WHEN alive THEN 1 ELSE 0 END) / NULLIF(COUNT(*), 0), 1) \
                 AS uptime FROM proxy_statistics WHERE protocol_id = ",
            );
            qb.push_bind(protocol.id());
            qb.push(" GROUP BY proxy_id) puf ON puf.proxy_id = p.id");
            match filter.kind {
                UptimeFilterKind::Min => qb.push(" WHERE puf.uptime >= "),
                UptimeFilterKind::Max => qb.push(" WHERE puf.uptime <= "),
            };
            qb.push_bind(filter.percentage);
        }

        qb.push(" ORDER BY p.id");

        let rows = qb.build().fetch_all(&mut **tx).await?;

        Ok(rows
            .into_iter()
            .map(|row| EligibleProxy {
                id: row.get("id"),
                ip: row.get("ip"),
                port: row.get::<i32, _>("port") as u16,
                username: row.get("username"),
                password: row.get("password"),
            })
            .collect())
    }

    /// Lease a free port on an instance: shuffle the declared range and take
    /// the first port with no `(instance_id, listen_port)` row.
    async fn allocate_port(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        instance_id: &str,
    ) -> Result<u16> {
        let mut ports: Vec<u16> = (self.ports.port_start..=self.ports.port_end).collect();
        if ports.is_empty() {
            return Err(MagpieError::PortExhausted);
        }
        ports.shuffle(&mut rand::thread_rng());

        for port in ports {
            let taken = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM rotating_proxies \
                 WHERE instance_id = $1 AND listen_port = $2",
            )
            .bind(instance_id)
            .bind(port as i32)
            .fetch_one(&mut **tx)
            .await?;

            if taken == 0 {
                return Ok(port);
            }
        }

        Err(MagpieError::PortExhausted)
    }

    fn row_to_rotator(&self, row: &PgRow) -> Result<RotatingProxy> {
        let protocol = Protocol::from_id(row.get("protocol_id"))
            .ok_or_else(|| MagpieError::Internal("unknown rotator protocol id".into()))?;
        let listen_protocol =
            Protocol::from_id(row.get("listen_protocol_id")).unwrap_or(protocol);

        let uptime_filter = match (
            UptimeFilterKind::from_str(&row.get::<String, _>("uptime_filter_type")),
            row.get::<Option<f64>, _>("uptime_percentage"),
        ) {
            (Some(kind), Some(percentage)) if (0.0..=100.0).contains(&percentage) => {
                Some(UptimeFilter {
                    kind,
                    percentage: crate::models::round1(percentage),
                })
            }
            _ => None,
        };

        let raw_labels: Vec<String> =
            serde_json::from_value(row.get::<serde_json::Value, _>("reputation_labels"))
                .unwrap_or_default();

        Ok(RotatingProxy {
            id: row.get("id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
            instance_id: row.get("instance_id"),
            instance_name: row.get("instance_name"),
            instance_region: row.get("instance_region"),
            protocol,
            listen_protocol,
            transport: TransportProtocol::normalize(&row.get::<String, _>("transport_protocol")),
            listen_transport: TransportProtocol::normalize(
                &row.get::<String, _>("listen_transport_protocol"),
            ),
            uptime_filter,
            listen_port: row.get::<i32, _>("listen_port") as u16,
            auth_required: row.get("auth_required"),
            auth_username: row.get("auth_username"),
            auth_password: self.cipher.decrypt(&row.get::<String, _>("auth_password"))?,
            reputation_labels: sanitize_reputation_labels(&raw_labels),
            last_proxy_id: row.get("last_proxy_id"),
            last_rotation_at: row.get("last_rotation_at"),
            created_at: row.get("created_at"),
        })
    }
}

fn rotator_info(rotator: &RotatingProxy, alive_count: usize) -> RotatorInfo {
    RotatorInfo {
        id: rotator.id,
        name: rotator.name.clone(),
        instance_id: rotator.instance_id.clone(),
        instance_name: rotator.instance_name.clone(),
        instance_region: rotator.instance_region.clone(),
        protocol: rotator.protocol,
        listen_protocol: rotator.listen_protocol,
        transport_protocol: rotator.transport,
        listen_transport_protocol: rotator.listen_transport,
        uptime_filter_type: rotator.uptime_filter.map(|f| f.kind),
        uptime_percentage: rotator.uptime_filter.map(|f| f.percentage),
        alive_proxy_count: alive_count,
        listen_port: rotator.listen_port,
        auth_required: rotator.auth_required,
        auth_username: rotator.auth_username.clone(),
        reputation_labels: rotator.reputation_labels.clone(),
        last_rotation_at: rotator.last_rotation_at,
        created_at: rotator.created_at,
    }
}

/// Map unique-constraint violations to their domain errors
fn map_unique_violation(err: sqlx::Error) -> MagpieError {
    if let sqlx::Error::Database(ref db_err) = err {
        match db_err.constraint() {
            Some("unique_rotator_user_name") => return MagpieError::RotatorNameConflict,
            Some("unique_rotator_instance_port") => return MagpieError::PortExhausted,
            _ => {}
        }
    }
    MagpieError::Database(err)
}
