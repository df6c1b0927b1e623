use std::collections::HashMap;

use sqlx::{PgPool, Row};

use crate::error::Result;
use crate::models::User;

/// A user's judge relation as stored: judge id, URL and match regex
#[derive(Debug, Clone)]
pub struct UserJudgeRow {
    pub judge_id: i64,
    pub full_string: String,
    pub regex: String,
}

/// Repository for the user data the runtime core consumes
#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, user_id: i64) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, email, http_protocol, https_protocol, socks4_protocol,
                   socks5_protocol, timeout_ms, retries, use_https_for_socks
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_user))
    }

    pub async fn list(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(
            r#"
            SELECT id, email, http_protocol, https_protocol, socks4_protocol,
                   socks5_protocol, timeout_ms, retries, use_https_for_socks
            FROM users
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_user).collect())
    }

    /// Judge relations for every user, the judge pool's load shape
    pub async fn judges_by_user(&self) -> Result<HashMap<i64, Vec<UserJudgeRow>>> {
        let rows = sqlx::query(
            r#"
            SELECT uj.user_id, j.id AS judge_id, j.full_string, uj.regex
            FROM user_judges uj
            JOIN judges j ON j.id = uj.judge_id
            ORDER BY uj.user_id, j.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_user: HashMap<i64, Vec<UserJudgeRow>> = HashMap::new();
        for row in rows {
            by_user
                .entry(row.get("user_id"))
                .or_default()
                .push(UserJudgeRow {
                    judge_id: row.get("judge_id"),
                    full_string: row.get("full_string"),
                    regex: row.get("regex"),
                });
        }

        Ok(by_user)
    }

    /// Judge relations for a single user, used on settings change
    pub async fn judges_for_user(&self, user_id: i64) -> Result<Vec<UserJudgeRow>> {
        let rows = sqlx::query(
            r#"
            SELECT j.id AS judge_id, j.full_string, uj.regex
            FROM user_judges uj
            JOIN judges j ON j.id = uj.judge_id
            WHERE uj.user_id = $1
            ORDER BY j.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| UserJudgeRow {
                judge_id: row.get("judge_id"),
                full_string: row.get("full_string"),
                regex: row.get("regex"),
            })
            .collect())
    }
}

fn row_to_user(row: sqlx::postgres::PgRow) -> User {
    User {
        id: row.get("id"),
        email: row.get("email"),
        http_protocol: row.get("http_protocol"),
        https_protocol: row.get("https_protocol"),
        socks4_protocol: row.get("socks4_protocol"),
        socks5_protocol: row.get("socks5_protocol"),
        timeout_ms: row.get::<i32, _>("timeout_ms") as u16,
        retries: row.get::<i16, _>("retries") as u8,
        use_https_for_socks: row.get("use_https_for_socks"),
    }
}
