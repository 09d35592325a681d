//! In-process cache store backed by `DashMap`.
//!
//! Expired entries are treated as absent on every read and removed lazily;
//! [`CacheSweeper`] removes the rest on a fixed interval so memory stays
//! bounded by the live key set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::{CacheError, CacheStore};
use crate::service::worker::BackgroundRunnable;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn new(value: &[u8], ttl: Duration) -> Self {
        Self {
            value: value.to_vec(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// `DashMap`-backed [`CacheStore`] for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    fn live(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        self.entries.get(key).map(|entry| entry.value.clone())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) if occupied.get().is_expired(now) => {
                occupied.insert(Entry::new(value, ttl));
                Ok(true)
            }
            MapEntry::Occupied(_) => Ok(false),
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.live(key))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.live(key).is_some())
    }
}

// ---------------------------------------------------------------------------
// CacheSweeper
// ---------------------------------------------------------------------------

/// On-demand work for the sweeper.
#[derive(Debug)]
pub enum SweepTask {
    /// Sweep now instead of waiting for the next tick.
    SweepNow,
    /// Drop one key regardless of its expiry.
    Evict { key: String },
}

/// [`BackgroundRunnable`] that evicts expired entries of a [`MemoryStore`] on every tick.
pub struct CacheSweeper {
    store: Arc<MemoryStore>,
}

impl CacheSweeper {
    #[must_use]
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BackgroundRunnable for CacheSweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::SweepNow => {
                let removed = self.store.sweep();
                debug!(removed, "cache sweep (requested)");
            }
            SweepTask::Evict { key } => {
                self.store.entries.remove(&key);
            }
        }
    }

    async fn on_tick(&mut self) {
        let removed = self.store.sweep();
        if removed > 0 {
            debug!(removed, remaining = self.store.len(), "cache sweep");
        }
    }
}
