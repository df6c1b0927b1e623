use crate::error::{MagpieError, Result};
use sqlx::PgPool;
use tracing::info;

/// Run all database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    create_migrations_table(pool).await?;

    let migrations = get_migrations();

    for (version, name, sql) in migrations {
        if !is_migration_applied(pool, version).await? {
            info!(version = version, name = name, "Applying migration");

            sqlx::query(sql)
                .execute(pool)
                .await
                .map_err(MagpieError::Database)?;

            record_migration(pool, version, name).await?;

            info!(version = version, name = name, "Migration applied successfully");
        }
    }

    Ok(())
}

/// Create the migrations tracking table
async fn create_migrations_table(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(MagpieError::Database)?;

    Ok(())
}

/// Check if a migration has been applied
async fn is_migration_applied(pool: &PgPool, version: i32) -> Result<bool> {
    let result = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM schema_migrations WHERE version = $1",
    )
    .bind(version)
    .fetch_one(pool)
    .await
    .map_err(MagpieError::Database)?;

    Ok(result > 0)
}

/// Record a migration as applied
async fn record_migration(pool: &PgPool, version: i32, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
        .bind(version)
        .bind(name)
        .execute(pool)
        .await
        .map_err(MagpieError::Database)?;

    Ok(())
}

/// Get all migrations in order
fn get_migrations() -> Vec<(i32, &'static str, &'static str)> {
    vec![
        (1, "users_and_proxies", MIGRATION_001_USERS_AND_PROXIES),
        (2, "judges", MIGRATION_002_JUDGES),
        (3, "statistics", MIGRATION_003_STATISTICS),
        (4, "rotating_proxies", MIGRATION_004_ROTATING_PROXIES),
    ]
}

// Migration 1: tenants, proxies and their many-to-many association.
// IP and password columns hold AES-GCM ciphertext.
const MIGRATION_001_USERS_AND_PROXIES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    email VARCHAR(255) NOT NULL UNIQUE,
    http_protocol BOOLEAN NOT NULL DEFAULT FALSE,
    https_protocol BOOLEAN NOT NULL DEFAULT TRUE,
    socks4_protocol BOOLEAN NOT NULL DEFAULT FALSE,
    socks5_protocol BOOLEAN NOT NULL DEFAULT FALSE,
    timeout_ms INTEGER NOT NULL DEFAULT 7500,
    retries SMALLINT NOT NULL DEFAULT 2,
    use_https_for_socks BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS proxies (
    id BIGSERIAL PRIMARY KEY,
    ip TEXT NOT NULL DEFAULT '',
    port INTEGER NOT NULL,
    username VARCHAR(255) NOT NULL DEFAULT '',
    password TEXT NOT NULL DEFAULT '',
    country VARCHAR(56) NOT NULL DEFAULT '',
    estimated_type VARCHAR(20) NOT NULL DEFAULT 'unknown',
    hash BYTEA NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT unique_proxy_hash UNIQUE (hash)
);

CREATE TABLE IF NOT EXISTS user_proxies (
    user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    proxy_id BIGINT NOT NULL REFERENCES proxies(id) ON DELETE CASCADE,
    PRIMARY KEY (user_id, proxy_id)
);

CREATE INDEX IF NOT EXISTS idx_user_proxies_proxy ON user_proxies(proxy_id);
"#;

// Migration 2: judges shared across users, with per-user regexes
const MIGRATION_002_JUDGES: &str = r#"
CREATE TABLE IF NOT EXISTS judges (
    id BIGSERIAL PRIMARY KEY,
    full_string VARCHAR(512) NOT NULL UNIQUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS user_judges (
    user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    judge_id BIGINT NOT NULL REFERENCES judges(id) ON DELETE CASCADE,
    regex VARCHAR(512) NOT NULL DEFAULT '',
    PRIMARY KEY (user_id, judge_id)
);
"#;

// Migration 3: append-only statistics plus the two materialized tables
const MIGRATION_003_STATISTICS: &str = r#"
CREATE TABLE IF NOT EXISTS proxy_statistics (
    id BIGSERIAL PRIMARY KEY,
    proxy_id BIGINT NOT NULL REFERENCES proxies(id) ON DELETE CASCADE,
    protocol_id INTEGER NOT NULL,
    judge_id BIGINT NOT NULL REFERENCES judges(id) ON DELETE CASCADE,
    alive BOOLEAN NOT NULL,
    response_time_ms INTEGER NOT NULL DEFAULT 0,
    attempt SMALLINT NOT NULL DEFAULT 0,
    level_id INTEGER,
    country VARCHAR(56) NOT NULL DEFAULT '',
    estimated_type VARCHAR(20) NOT NULL DEFAULT 'unknown',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_statistics_proxy_protocol
    ON proxy_statistics(proxy_id, protocol_id);
CREATE INDEX IF NOT EXISTS idx_statistics_created_at
    ON proxy_statistics(created_at);

CREATE TABLE IF NOT EXISTS proxy_latest_statistics (
    proxy_id BIGINT NOT NULL REFERENCES proxies(id) ON DELETE CASCADE,
    protocol_id INTEGER NOT NULL,
    alive BOOLEAN NOT NULL,
    statistic_id BIGINT NOT NULL,
    checked_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (proxy_id, protocol_id)
);

CREATE INDEX IF NOT EXISTS idx_latest_protocol_alive
    ON proxy_latest_statistics(protocol_id, alive);

CREATE TABLE IF NOT EXISTS proxy_overall_statuses (
    proxy_id BIGINT PRIMARY KEY REFERENCES proxies(id) ON DELETE CASCADE,
    overall_alive BOOLEAN NOT NULL,
    last_checked_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_overall_alive ON proxy_overall_statuses(overall_alive);

CREATE TABLE IF NOT EXISTS proxy_reputations (
    proxy_id BIGINT NOT NULL REFERENCES proxies(id) ON DELETE CASCADE,
    kind VARCHAR(32) NOT NULL,
    score NUMERIC(5,2) NOT NULL DEFAULT 0,
    label VARCHAR(16) NOT NULL DEFAULT 'neutral',
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (proxy_id, kind)
);
"#;

// Migration 4: per-tenant rotating proxy listeners.
// (instance_id, listen_port) uniqueness backs the soft port lease.
const MIGRATION_004_ROTATING_PROXIES: &str = r#"
CREATE TABLE IF NOT EXISTS rotating_proxies (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name VARCHAR(120) NOT NULL,
    instance_id VARCHAR(191) NOT NULL,
    instance_name VARCHAR(120) NOT NULL DEFAULT '',
    instance_region VARCHAR(120) NOT NULL DEFAULT '',
    protocol_id INTEGER NOT NULL,
    listen_protocol_id INTEGER NOT NULL,
    transport_protocol VARCHAR(8) NOT NULL DEFAULT 'tcp',
    listen_transport_protocol VARCHAR(8) NOT NULL DEFAULT 'tcp',
    uptime_filter_type VARCHAR(8) NOT NULL DEFAULT '',
    uptime_percentage NUMERIC(5,2),
    listen_port INTEGER NOT NULL,
    auth_required BOOLEAN NOT NULL DEFAULT FALSE,
    auth_username VARCHAR(120) NOT NULL DEFAULT '',
    auth_password TEXT NOT NULL DEFAULT '',
    reputation_labels JSONB NOT NULL DEFAULT '[]',
    last_proxy_id BIGINT,
    last_rotation_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT unique_rotator_user_name UNIQUE (user_id, name),
    CONSTRAINT unique_rotator_instance_port UNIQUE (instance_id, listen_port)
);

CREATE INDEX IF NOT EXISTS idx_rotating_proxies_instance ON rotating_proxies(instance_id);
"#;
