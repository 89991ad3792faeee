use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::kv::{DynStore, KvError};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Failed to acquire cache lock")]
    Lock,
    #[error("Backing store error: {0}")]
    Store(#[from] KvError),
    #[error("Failed to encode cached value: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    last_used: u64,
}

#[derive(Debug)]
struct LruState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// `last_used` tick -> key, oldest first.
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl<V> LruState<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_used);
        Some(entry)
    }
}

/// Capacity-bounded LRU map with per-entry TTL. With a backing store the
/// cache writes through so other instances observe the same values.
#[derive(Debug)]
pub struct CacheManager<V> {
    namespace: &'static str,
    config: CacheConfig,
    state: Mutex<LruState<V>>,
    backing: Option<DynStore>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V> CacheManager<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(namespace: &'static str, config: CacheConfig) -> Self {
        Self {
            namespace,
            config,
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
            }),
            backing: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_write_through(mut self, store: DynStore) -> Self {
        self.backing = Some(store);
        self
    }

    fn store_key(&self, key: &str) -> String {
        format!("cache:{}:{key}", self.namespace)
    }

    pub async fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        if let Some(value) = self.get_local(key)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }

        let Some(store) = &self.backing else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let Some(raw) = store.get(&self.store_key(key)).await? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        match serde_json::from_str::<V>(&raw) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.insert_local(key, value.clone())?;
                Ok(Some(value))
            }
            Err(e) => {
                warn!(namespace = self.namespace, key, "Dropping undecodable cache entry: {e}");
                store.delete(&self.store_key(key)).await?;
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub async fn set(&self, key: &str, value: V) -> Result<(), CacheError> {
        if let Some(store) = &self.backing {
            let raw = serde_json::to_string(&value)?;
            store
                .set(&self.store_key(key), &raw, Some(self.config.ttl))
                .await?;
        }

        self.insert_local(key, value)
    }

    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.state.lock().map_err(|_| CacheError::Lock)?.remove(key);

        if let Some(store) = &self.backing {
            store.delete(&self.store_key(key)).await?;
        }

        debug!(namespace = self.namespace, key, "Cache entry invalidated");
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let entries = self.state.lock().map_err(|_| CacheError::Lock)?.entries.len();

        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries,
        })
    }

    fn get_local(&self, key: &str) -> Result<Option<V>, CacheError> {
        let mut state = self.state.lock().map_err(|_| CacheError::Lock)?;
        let now = Instant::now();

        let expired = match state.entries.get(key) {
            None => return Ok(None),
            Some(entry) => entry.expires_at <= now,
        };

        if expired {
            state.remove(key);
            return Ok(None);
        }

        let tick = state.next_tick();
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(None);
        };
        let previous = std::mem::replace(&mut entry.last_used, tick);
        let value = entry.value.clone();

        state.recency.remove(&previous);
        state.recency.insert(tick, key.to_string());

        Ok(Some(value))
    }

    fn insert_local(&self, key: &str, value: V) -> Result<(), CacheError> {
        if self.config.capacity == 0 {
            return Ok(());
        }

        let mut state = self.state.lock().map_err(|_| CacheError::Lock)?;
        state.remove(key);

        while state.entries.len() >= self.config.capacity {
            let Some((_, oldest)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let tick = state.next_tick();
        state.recency.insert(tick, key.to_string());
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + self.config.ttl,
                last_used: tick,
            },
        );

        Ok(())
    }
}
