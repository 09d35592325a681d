//! Request deduplication cache and its backing stores.
//!
//! - [`dedup`]: fingerprinting, placeholder reservation, and generic TTL storage
//! - [`memory`]: in-process `DashMap` store with lazy expiry and a sweeper
//! - `redis`: shared store for multi-node deployments (feature `redis`)

pub mod dedup;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

pub use dedup::{fingerprint, DedupCache, REQUEST_KEY_PREFIX};
pub use memory::{CacheSweeper, MemoryStore, SweepTask};
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Errors from a cache backend.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cached value is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Key/value store with per-key expiry. Keys are opaque strings, values opaque bytes.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Atomically stores `value` unless the key already holds an unexpired value.
    /// Returns `true` when the value was stored.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration)
        -> Result<bool, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores `value`, replacing any previous value and refreshing the expiry.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration)
        -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
}

/// Result of looking a fingerprint up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Missing,
    /// Another request holds the placeholder and is still executing.
    InFlight,
    /// Serialized response of a completed request.
    Ready(Vec<u8>),
}

/// Result of trying to claim a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// This request owns the fingerprint and must execute.
    Acquired,
    /// Another request got there first.
    Held,
    /// The store failed; execute without caching.
    Unavailable,
}
