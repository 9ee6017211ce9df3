#![warn(clippy::unwrap_used)]

//! Cache tier: low-latency key/value store with TTLs and atomic increments.
//! Optional by contract; callers treat every error as "cache unreachable".

pub mod client;
pub mod local;

pub use client::RedisCache;
pub use local::LocalCache;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("cache backend error: {0}")]
    Backend(String),
}

impl From<CacheError> for adserve_core::AdServeError {
    fn from(e: CacheError) -> Self {
        adserve_core::AdServeError::CacheUnavailable(e.to_string())
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a numeric counter. Missing keys read as `None`.
    async fn get_counter(&self, key: &str) -> CacheResult<Option<f64>>;

    /// Atomically add `delta` to a counter and (re)arm its expiry.
    /// Returns the new value.
    async fn incr_counter(&self, key: &str, delta: f64, ttl: Duration) -> CacheResult<f64>;
}
