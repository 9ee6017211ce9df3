//! In-process counter cache backed by DashMap for lock-free concurrent access.
//! Stands in for Redis on single-node deployments and in tests.

use crate::{CacheResult, CacheStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

struct CounterEntry {
    value: f64,
    expires_at: Instant,
}

/// Lock-free local cache tier.
#[derive(Default)]
pub struct LocalCache {
    store: DashMap<String, CounterEntry>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        let now = Instant::now();
        self.store.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.store.len())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[async_trait]
impl CacheStore for LocalCache {
    async fn get_counter(&self, key: &str) -> CacheResult<Option<f64>> {
        let now = Instant::now();
        let Some(entry) = self.store.get(key) else {
            return Ok(None);
        };
        if entry.expires_at > now {
            return Ok(Some(entry.value));
        }
        drop(entry);
        // A concurrent incr may have re-armed the entry since the read.
        self.store.remove_if(key, |_, e| e.expires_at <= now);
        Ok(None)
    }

    async fn incr_counter(&self, key: &str, delta: f64, ttl: Duration) -> CacheResult<f64> {
        let now = Instant::now();
        let mut entry = self.store.entry(key.to_string()).or_insert(CounterEntry {
            value: 0.0,
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.value = 0.0;
        }
        entry.value += delta;
        entry.expires_at = now + ttl;
        Ok(entry.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_incr_accumulates() {
        let cache = LocalCache::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(cache.get_counter("k").await.unwrap(), None);
        assert_eq!(cache.incr_counter("k", 1.5, ttl).await.unwrap(), 1.5);
        assert_eq!(cache.incr_counter("k", 2.0, ttl).await.unwrap(), 3.5);
        assert_eq!(cache.get_counter("k").await.unwrap(), Some(3.5));
    }

    #[tokio::test]
    async fn test_expired_counter_restarts() {
        let cache = LocalCache::new();
        cache
            .incr_counter("k", 5.0, Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get_counter("k").await.unwrap(), None);
        assert_eq!(
            cache.incr_counter("k", 1.0, Duration::from_secs(60)).await.unwrap(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let cache = LocalCache::new();
        cache
            .incr_counter("old", 1.0, Duration::from_millis(1))
            .await
            .unwrap();
        cache
            .incr_counter("fresh", 1.0, Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_expiry_check_keeps_rearmed_counter() {
        let cache = Arc::new(LocalCache::new());
        for _ in 0..200 {
            cache.store.insert(
                "k".to_string(),
                CounterEntry {
                    value: 9.0,
                    expires_at: Instant::now(),
                },
            );
            let reader = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_counter("k").await })
            };
            let writer = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.incr_counter("k", 1.0, Duration::from_secs(60)).await })
            };
            reader.await.unwrap().unwrap();
            assert_eq!(writer.await.unwrap().unwrap(), 1.0);
            assert_eq!(cache.get_counter("k").await.unwrap(), Some(1.0));
        }
    }
}
