use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// Redis dependencies (only used by the Redis implementation)
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Remote atomic counter port backing the rate limiter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `n` and return the new value. A fresh key gets `ttl`.
    async fn incr_by(&self, key: &str, n: i64, ttl: Duration) -> Result<i64>;
    async fn decr(&self, key: &str) -> Result<i64>;
    async fn get(&self, key: &str) -> Result<Option<i64>>;
}

// ---------------- Redis implementation ----------------

#[derive(Clone)]
pub struct RedisCounterStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisCounterStore {
    pub async fn new(redis_url: &str, prefix: String) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(Self { manager, prefix })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_by(&self, key: &str, n: i64, ttl: Duration) -> Result<i64> {
        let redis_key = self.key(key);
        let mut conn = self.manager.clone();
        let current: i64 = conn.incr(&redis_key, n).await?;
        if current == n {
            let _: () = conn.expire(&redis_key, ttl.as_secs() as i64).await?;
        }
        Ok(current)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let redis_key = self.key(key);
        let mut conn = self.manager.clone();
        let current: i64 = conn.decr(&redis_key, 1).await?;
        Ok(current)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let redis_key = self.key(key);
        let mut conn = self.manager.clone();
        let current: Option<i64> = conn.get(&redis_key).await?;
        Ok(current)
    }
}

// ---------------- In-memory implementation ----------------

/// Single-process counter store. Used when no REDIS_URL is configured and by
/// the test suite.
#[derive(Clone, Default)]
pub struct InMemoryCounterStore {
    inner: Arc<Mutex<HashMap<String, (i64, Option<Instant>)>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_by(&self, key: &str, n: i64, ttl: Duration) -> Result<i64> {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        let entry = guard.entry(key.to_string()).or_insert((0, None));
        if let Some(expires) = entry.1 {
            if now >= expires {
                *entry = (0, None);
            }
        }
        if entry.0 == 0 {
            entry.1 = Some(now + ttl);
        }
        entry.0 += n;
        Ok(entry.0)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut guard = self.inner.lock().await;
        let entry = guard.entry(key.to_string()).or_insert((0, None));
        entry.0 -= 1;
        Ok(entry.0)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let guard = self.inner.lock().await;
        Ok(guard.get(key).and_then(|(v, expires)| {
            match expires {
                Some(at) if Instant::now() >= *at => None,
                _ => Some(*v),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_counter_increments_and_expires() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.incr_by("k", 1, Duration::from_millis(20)).await.unwrap(), 1);
        assert_eq!(store.incr_by("k", 1, Duration::from_millis(20)).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.incr_by("k", 1, Duration::from_millis(20)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_counter_decrements() {
        let store = InMemoryCounterStore::new();
        store.incr_by("slots", 2, Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.decr("slots").await.unwrap(), 1);
        assert_eq!(store.decr("slots").await.unwrap(), 0);
    }
}
