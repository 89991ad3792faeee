use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::info;

use super::{KeyValueStore, KvError};

/// ARGV: has_expected flag, expected, new value, ttl millis (0 = no expiry).
const COMPARE_AND_SWAP_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
local ttl = tonumber(ARGV[4])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
";

/// Redis-backed store for multi-instance deployments. Expiry is delegated to
/// Redis itself.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    compare_and_swap: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_connection_manager().await?;

        info!("Connected to Redis key-value store");

        Ok(Self {
            connection,
            compare_and_swap: redis::Script::new(COMPARE_AND_SWAP_SCRIPT),
        })
    }

    fn ttl_millis(ttl: Duration) -> Result<u64, KvError> {
        u64::try_from(ttl.as_millis()).map_err(|_| KvError::TtlOutOfRange(ttl))
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut connection = self.connection.clone();

        match ttl {
            Some(ttl) => {
                let () = connection
                    .pset_ex(key, value, Self::ttl_millis(ttl)?)
                    .await?;
            }
            None => {
                let () = connection.set(key, value).await?;
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut connection = self.connection.clone();
        let removed: i64 = connection.del(key).await?;
        Ok(removed > 0)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut connection = self.connection.clone();
        let ttl_ms = ttl.map(Self::ttl_millis).transpose()?.unwrap_or(0);

        let swapped: i64 = self
            .compare_and_swap
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(new)
            .arg(ttl_ms)
            .invoke_async(&mut connection)
            .await?;

        Ok(swapped == 1)
    }

    async fn purge_expired(&self) -> Result<u64, KvError> {
        Ok(0)
    }
}
