//! Redis-backed cache store for deployments where several nodes share one cache.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use super::{CacheError, CacheStore};

/// [`CacheStore`] on a Redis server, through a reconnecting `ConnectionManager`.
#[derive(Clone)]
pub struct RedisStore {
    conn_manager: ConnectionManager,
}

impl RedisStore {
    /// Connects to `redis_url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Unavailable` if the client cannot be created or
    /// the first connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = Client::open(redis_url).map_err(unavailable)?;
        let conn_manager = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self { conn_manager })
    }
}

#[allow(clippy::needless_pass_by_value)]
fn unavailable(err: redis::RedisError) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

#[allow(clippy::cast_possible_truncation)]
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn_manager.clone();
        // SET key value NX PX ttl replies OK when stored and nil otherwise.
        let stored: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(stored.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn_manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(unavailable)?;
        Ok(value)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .pset_ex(key, value, ttl_millis(ttl))
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.del(key).await.map_err(unavailable)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn_manager.clone();
        let found: bool = conn.exists(key).await.map_err(unavailable)?;
        Ok(found)
    }
}
