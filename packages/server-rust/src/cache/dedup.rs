//! Placeholder-based request deduplication over a [`CacheStore`].
//!
//! The first request with a given fingerprint writes an empty placeholder
//! (set-if-absent with a TTL) and executes; concurrent twins see the
//! placeholder and are answered with `#duplicate_request`; later twins read the
//! completed response. A failing backend never fails a request: every error
//! is logged and the request executes as if caching were off.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::{CacheError, CacheStore, Lookup, Reservation};
use crate::service::config::CacheMode;
use crate::service::operation::RequestContext;

/// Namespace of fingerprint keys.
pub const REQUEST_KEY_PREFIX: &str = "request.";

/// Deterministic key of a logical request.
///
/// Every component is length-prefixed before hashing, so shifting bytes
/// between adjacent fields always changes the key.
#[must_use]
pub fn fingerprint(method: &str, uri: &str, token: Option<&str>, body: &[u8], secret: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [
        method.as_bytes(),
        uri.as_bytes(),
        token.unwrap_or_default().as_bytes(),
        body,
        secret.as_bytes(),
    ] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    format!("{REQUEST_KEY_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Request deduplication plus generic JSON storage with TTL.
#[derive(Clone)]
pub struct DedupCache {
    store: Arc<dyn CacheStore>,
    secret: String,
}

impl DedupCache {
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, secret: impl Into<String>) -> Self {
        Self {
            store,
            secret: secret.into(),
        }
    }

    /// Fingerprint of a request. The identity token only counts in `User` mode.
    #[must_use]
    pub fn key_for(&self, ctx: &RequestContext, body: &[u8], mode: CacheMode) -> String {
        let token = match mode {
            CacheMode::User => ctx.token.as_deref(),
            CacheMode::All | CacheMode::Disabled => None,
        };
        fingerprint(ctx.method.as_str(), &ctx.uri, token, body, &self.secret)
    }

    /// Returns `true` when the key holds a placeholder or a response.
    pub async fn exists(&self, key: &str) -> bool {
        match self.store.exists(key).await {
            Ok(found) => found,
            Err(err) => {
                warn!(key, error = %err, "cache exists check failed");
                false
            }
        }
    }

    /// Claims `key` with an empty placeholder that expires after `ttl`.
    pub async fn reserve(&self, key: &str, ttl: Duration) -> Reservation {
        match self.store.set_if_absent(key, &[], ttl).await {
            Ok(true) => Reservation::Acquired,
            Ok(false) => Reservation::Held,
            Err(err) => {
                warn!(key, error = %err, "cache reservation failed, executing uncached");
                Reservation::Unavailable
            }
        }
    }

    /// Replaces the placeholder with the final serialized response.
    pub async fn complete(&self, key: &str, ttl: Duration, value: &[u8]) {
        if let Err(err) = self.store.set_with_ttl(key, value, ttl).await {
            warn!(key, error = %err, "failed to store completed response");
        }
    }

    /// Looks a fingerprint up. Backend errors read as `Missing`.
    pub async fn fetch(&self, key: &str) -> Lookup {
        match self.store.get(key).await {
            Ok(None) => Lookup::Missing,
            Ok(Some(value)) if value.is_empty() => Lookup::InFlight,
            Ok(Some(value)) => Lookup::Ready(value),
            Err(err) => {
                warn!(key, error = %err, "cache lookup failed");
                Lookup::Missing
            }
        }
    }

    /// Stores any serializable value as JSON.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if serialization or the backend fails.
    pub async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        ttl: Duration,
        value: &T,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.store.set_with_ttl(key, &bytes, ttl).await
    }

    /// Reads a value stored by [`set_json`](Self::set_json).
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the backend fails or the value does not decode.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.store.get(key).await? {
            Some(bytes) if !bytes.is_empty() => Ok(Some(serde_json::from_slice(&bytes)?)),
            _ => Ok(None),
        }
    }

    /// # Errors
    ///
    /// Returns `CacheError` if the backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.delete(key).await
    }
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache").finish_non_exhaustive()
    }
}
