use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;

use super::{KeyValueStore, KvError, ttl_millis};

/// Stores entries in the `kv_entries` table of the main database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn expiry(now_ms: i64, ttl: Option<Duration>) -> Result<Option<i64>, KvError> {
        ttl.map(|ttl| Ok(now_ms.saturating_add(ttl_millis(ttl)?)))
            .transpose()
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now_ms = Utc::now().timestamp_millis();

        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_entries WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        )
        .bind(key)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let expires_at = Self::expiry(Utc::now().timestamp_millis(), ttl)?;

        sqlx::query(
            r"
            INSERT INTO kv_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            ",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let now_ms = Utc::now().timestamp_millis();

        let result = sqlx::query(
            "DELETE FROM kv_entries WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        )
        .bind(key)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let now_ms = Utc::now().timestamp_millis();
        let expires_at = Self::expiry(now_ms, ttl)?;

        let result = match expected {
            Some(expected) => {
                sqlx::query(
                    r"
                    UPDATE kv_entries SET value = ?1, expires_at = ?2
                    WHERE key = ?3 AND value = ?4 AND (expires_at IS NULL OR expires_at > ?5)
                    ",
                )
                .bind(new)
                .bind(expires_at)
                .bind(key)
                .bind(expected)
                .bind(now_ms)
                .execute(&self.pool)
                .await?
            }
            // Insert, or take over a row that has expired but not been purged.
            None => {
                sqlx::query(
                    r"
                    INSERT INTO kv_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
                    WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= ?4
                    ",
                )
                .bind(key)
                .bind(new)
                .bind(expires_at)
                .bind(now_ms)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self) -> Result<u64, KvError> {
        let now_ms = Utc::now().timestamp_millis();

        let result =
            sqlx::query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1")
                .bind(now_ms)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}
