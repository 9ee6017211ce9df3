//! Redis cache tier client. Every command runs under a short timeout so a
//! slow or unreachable Redis cannot stall the serving path.

use crate::{CacheError, CacheResult, CacheStore};
use adserve_core::config::RedisConfig;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Redis-backed cache tier.
pub struct RedisCache {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisCache {
    /// Connect to Redis and verify connectivity with a PING.
    pub async fn new(config: &RedisConfig) -> CacheResult<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url.as_str()).map_err(classify)?;
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout(connect_timeout))?
            .map_err(classify)?;

        let cache = Self {
            conn,
            op_timeout: Duration::from_millis(config.op_timeout_ms),
        };

        let mut conn = cache.conn.clone();
        let pong: String = cache
            .run(async move { redis::cmd("PING").query_async::<_, String>(&mut conn).await })
            .await?;
        info!(response = %pong, "Redis connection established");

        Ok(cache)
    }

    async fn run<T, F>(&self, op: F) -> CacheResult<T>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                metrics::counter!("cache.errors").increment(1);
                Err(classify(e))
            }
            Err(_) => {
                metrics::counter!("cache.timeouts").increment(1);
                Err(CacheError::Timeout(self.op_timeout))
            }
        }
    }
}

fn classify(e: RedisError) -> CacheError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        CacheError::Unavailable(e.to_string())
    } else {
        CacheError::Backend(e.to_string())
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get_counter(&self, key: &str) -> CacheResult<Option<f64>> {
        let mut conn = self.conn.clone();
        let value: Option<f64> = self.run(async move { conn.get::<_, Option<f64>>(key).await }).await?;
        debug!(key = key, value = ?value, "Counter read");
        Ok(value)
    }

    async fn incr_counter(&self, key: &str, delta: f64, ttl: Duration) -> CacheResult<f64> {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        let (value,): (f64,) = self
            .run(async move {
                redis::pipe()
                    .atomic()
                    .cmd("INCRBYFLOAT")
                    .arg(key)
                    .arg(delta)
                    .cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl_secs)
                    .ignore()
                    .query_async::<_, (f64,)>(&mut conn)
                    .await
            })
            .await?;
        Ok(value)
    }
}
