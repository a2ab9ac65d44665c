//! Typed response cache over serialized payloads
//!
//! Values are stored as JSON bytes in an [`LruCache`], so memory accounting
//! reflects the serialized size. Keys are built from a namespace, an
//! endpoint, and the SHA-256 digest of the request parameters.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::lru::{CacheStats, LruCache};
use crate::Result;
use crate::config::CacheConfig;

/// Cache of serialized API responses
pub struct ResponseCache {
    entries: Arc<LruCache<Bytes>>,
}

impl ResponseCache {
    /// Create a cache from config
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Arc::new(LruCache::from_config(config)),
        }
    }

    /// Wrap an existing LRU cache
    #[must_use]
    pub fn with_cache(entries: LruCache<Bytes>) -> Self {
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Get and decode a cached response
    ///
    /// An entry that no longer decodes as `T` is dropped and reported as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.entries.get(key)?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Dropping undecodable cache entry");
                self.entries.delete(key);
                None
            }
        }
    }

    /// Serialize and store a response with the default TTL
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] if `value` cannot be serialized.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.entries.set(key, Bytes::from(raw));
        Ok(())
    }

    /// Serialize and store a response with an explicit TTL
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] if `value` cannot be serialized.
    pub fn set_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.entries.set_with_ttl(key, Bytes::from(raw), ttl);
        Ok(())
    }

    /// Remove a cached response
    pub fn delete(&self, key: &str) -> bool {
        self.entries.delete(key)
    }

    /// Sweep expired entries
    pub fn cleanup_expired(&self) -> usize {
        self.entries.cleanup_expired()
    }

    /// Statistics of the underlying cache
    pub fn stats(&self) -> CacheStats {
        self.entries.stats()
    }

    /// The underlying LRU cache, shareable with [`super::spawn_cleanup`]
    #[must_use]
    pub fn inner(&self) -> &Arc<LruCache<Bytes>> {
        &self.entries
    }

    /// Build a cache key from namespace, endpoint, and request parameters
    ///
    /// The key format is `{namespace}:{endpoint}:{params_hash}` where
    /// `params_hash` is the SHA-256 hex digest of the parameters as JSON.
    #[must_use]
    pub fn build_key(namespace: &str, endpoint: &str, params: &Value) -> String {
        let params_hash = Self::hash_params(params);
        format!("{namespace}:{endpoint}:{params_hash}")
    }

    fn hash_params(params: &Value) -> String {
        // serde_json maps are ordered, so equal objects serialize identically
        let canonical = serde_json::to_string(params).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}
