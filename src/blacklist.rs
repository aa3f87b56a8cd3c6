//! Outstanding and blacklisted refresh tokens.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use crate::error::Result;

fn timestamp(secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Store of issued refresh tokens, keyed by their `jti`.
#[async_trait]
pub trait TokenBlacklist: Send + Sync {
    /// Record a freshly issued refresh token as outstanding.
    async fn register(&self, jti: &str, user_id: i64, expires_at: u64) -> Result<()>;

    /// Blacklist an outstanding token.
    ///
    /// Returns `false` if the token is unknown or already blacklisted.
    async fn blacklist(&self, jti: &str) -> Result<bool>;

    /// Whether a token is known and not blacklisted.
    ///
    /// Purged tokens are unknown, hence never active.
    async fn is_active(&self, jti: &str) -> Result<bool>;

    /// Forget every expired token. Returns the number of removed records.
    async fn purge_expired(&self) -> Result<u64>;
}

/// PostgreSQL [`TokenBlacklist`].
#[derive(Clone)]
pub struct PgTokenBlacklist {
    pool: Pool<Postgres>,
}

impl PgTokenBlacklist {
    /// Create a new [`PgTokenBlacklist`].
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenBlacklist for PgTokenBlacklist {
    async fn register(&self, jti: &str, user_id: i64, expires_at: u64) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO refresh_tokens (jti, user_id, expires_at)
                VALUES ($1, $2, $3)"#,
        )
        .bind(jti)
        .bind(user_id)
        .bind(timestamp(expires_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn blacklist(&self, jti: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE refresh_tokens
                SET blacklisted_at = NOW()
                WHERE jti = $1 AND blacklisted_at IS NULL"#,
        )
        .bind(jti)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn is_active(&self, jti: &str) -> Result<bool> {
        let (active,) = sqlx::query_as::<_, (bool,)>(
            r#"SELECT EXISTS (
                SELECT 1 FROM refresh_tokens
                WHERE jti = $1 AND blacklisted_at IS NULL AND expires_at > NOW()
            )"#,
        )
        .bind(jti)
        .fetch_one(&self.pool)
        .await?;

        Ok(active)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result =
            sqlx::query(r#"DELETE FROM refresh_tokens WHERE expires_at <= NOW()"#)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
struct Outstanding {
    user_id: i64,
    expires_at: u64,
    blacklisted: bool,
}

/// In-process [`TokenBlacklist`].
#[derive(Default)]
pub struct MemoryTokenBlacklist {
    tokens: Mutex<HashMap<String, Outstanding>>,
}

impl MemoryTokenBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn purge_at(&self, now: u64) -> u64 {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        let before = tokens.len();
        tokens.retain(|_, token| token.expires_at > now);
        (before - tokens.len()) as u64
    }
}

#[async_trait]
impl TokenBlacklist for MemoryTokenBlacklist {
    async fn register(&self, jti: &str, user_id: i64, expires_at: u64) -> Result<()> {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.insert(
            jti.to_owned(),
            Outstanding {
                user_id,
                expires_at,
                blacklisted: false,
            },
        );
        tracing::trace!(user_id, "refresh token registered");

        Ok(())
    }

    async fn blacklist(&self, jti: &str) -> Result<bool> {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get_mut(jti) {
            Some(token) if !token.blacklisted => {
                token.blacklisted = true;
                tracing::debug!(user_id = token.user_id, "refresh token blacklisted");
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn is_active(&self, jti: &str) -> Result<bool> {
        let now = crate::token::now();
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tokens
            .get(jti)
            .is_some_and(|token| !token.blacklisted && token.expires_at > now))
    }

    async fn purge_expired(&self) -> Result<u64> {
        Ok(self.purge_at(crate::token::now()))
    }
}
