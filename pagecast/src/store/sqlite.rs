//! SQLite store backend.
//!
//! Several coordinator processes can share one database file. Every store
//! primitive maps to a single SQL statement so SQLite's write lock gives the
//! per-key atomicity the lease lock relies on.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::Store;
use crate::Result;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 8;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// How often a blocking pop re-checks the list.
const POP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Store backend on top of a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    options: SqliteConnectOptions,
    in_memory: bool,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// Escape `LIKE` wildcards so a prefix matches literally.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

impl SqliteStore {
    /// Open (creating if missing) the database and apply migrations.
    ///
    /// # Arguments
    /// * `database_url` - SQLite database URL (e.g., "sqlite:pagecast.db")
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with_size(database_url, DEFAULT_POOL_SIZE).await
    }

    pub async fn connect_with_size(database_url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let options = SqliteConnectOptions::from_str(database_url)?
            // WAL lets pollers read while another process writes
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
            .create_if_missing(true);

        // An in-memory database lives and dies with its single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options.clone())
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!(
            in_memory,
            "Coordination store opened with {} max connections",
            if in_memory { 1 } else { max_connections }
        );

        Ok(Self {
            pool,
            options,
            in_memory,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn try_pop(&self, list: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            "DELETE FROM list_item WHERE id = (SELECT id FROM list_item WHERE name = ?1 ORDER BY id LIMIT 1) RETURNING value",
        )
        .bind(list)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        )
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.map(expiry_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // The upsert only overwrites an expired row, so a live key is left alone
        // and reports zero affected rows.
        let result = sqlx::query(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
             WHERE kv.expires_at IS NOT NULL AND kv.expires_at <= ?4",
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ms(ttl))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn expire_if_eq(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE kv SET expires_at = ?3
             WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?4)",
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ms(ttl))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM kv WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
        )
        .bind(key)
        .bind(value)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for statement in [
            "DELETE FROM kv WHERE key = ?1",
            "DELETE FROM zset WHERE name = ?1",
            "DELETE FROM list_item WHERE name = ?1",
        ] {
            removed += sqlx::query(statement)
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn zadd(&self, set: &str, score: i64, member: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO zset (name, member, score) VALUES (?1, ?2, ?3)
             ON CONFLICT(name, member) DO UPDATE SET score = excluded.score",
        )
        .bind(set)
        .bind(member)
        .bind(score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM zset WHERE name = ?1 AND member = ?2")
            .bind(set)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn zscore(&self, set: &str, member: &str) -> Result<Option<i64>> {
        let score: Option<i64> =
            sqlx::query_scalar("SELECT score FROM zset WHERE name = ?1 AND member = ?2")
                .bind(set)
                .bind(member)
                .fetch_optional(&self.pool)
                .await?;
        Ok(score)
    }

    async fn zrange_by_score(&self, set: &str, min: i64, max: i64) -> Result<Vec<String>> {
        let members: Vec<String> = sqlx::query_scalar(
            "SELECT member FROM zset WHERE name = ?1 AND score >= ?2 AND score <= ?3
             ORDER BY score, member",
        )
        .bind(set)
        .bind(min)
        .bind(max)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn rpush(&self, list: &str, value: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO list_item (name, value) VALUES (?1, ?2)")
            .bind(list)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM list_item WHERE name = ?1")
            .bind(list)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(len.max(0) as u64)
    }

    async fn blocking_pop(&self, list: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.try_pop(list).await? {
                return Ok(Some(value));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM kv WHERE key LIKE ?1 ESCAPE '\\'
             AND (expires_at IS NULL OR expires_at > ?2) ORDER BY key",
        )
        .bind(like_prefix(prefix))
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn dedicated(&self) -> Result<Arc<dyn Store>> {
        if self.in_memory {
            debug!("In-memory store shares its single connection for blocking operations");
            return Ok(Arc::new(self.clone()));
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(self.options.clone())
            .await?;
        Ok(Arc::new(Self {
            pool,
            options: self.options.clone(),
            in_memory: false,
        }))
    }
}
