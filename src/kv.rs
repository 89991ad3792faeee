//! Expiring string key-value storage used for carts and the shared menu
//! cache. Backends agree on one contract: expired entries are invisible to
//! readers, and `compare_and_swap` is the only race-free write path.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

mod memory;
mod redis;
mod sqlite;

pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use sqlite::SqliteStore;

pub type DynStore = Arc<dyn KeyValueStore>;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Key-value database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("TTL of {0:?} is too large to store")]
    TtlOutOfRange(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum KvBackend {
    Sqlite,
    Memory,
    Redis,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync + Debug + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Unconditionally writes `value`. `None` ttl never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Writes `new` only if the live value still equals `expected`, where
    /// `None` means the key must be absent or expired. Returns whether the
    /// write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    /// Drops expired entries, returning how many were removed. Backends with
    /// native expiry report zero.
    async fn purge_expired(&self) -> Result<u64, KvError>;
}

pub(crate) fn ttl_millis(ttl: Duration) -> Result<i64, KvError> {
    i64::try_from(ttl.as_millis()).map_err(|_| KvError::TtlOutOfRange(ttl))
}
