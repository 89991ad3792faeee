use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{KeyValueStore, KvError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// Process-local store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(value: &str, ttl: Option<Duration>, now: Instant) -> Entry {
        Entry {
            value: value.to_string(),
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;

        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .insert(key.to_string(), Self::entry(value, ttl, now));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let now = Instant::now();
        let removed = self.entries.lock().await.remove(key);
        Ok(removed.is_some_and(|entry| entry.is_live(now)))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let current = entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.as_str());

        if current != expected {
            return Ok(false);
        }

        entries.insert(key.to_string(), Self::entry(new, ttl, now));
        Ok(true)
    }

    async fn purge_expired(&self) -> Result<u64, KvError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok((before - entries.len()) as u64)
    }
}
