//! Read-through cache over the shared store.
//!
//! The cache is never required for correctness: when the store fails, reads
//! are misses and writes/invalidations are skipped with a warning.
//!
//! Keys are `namespace:operation[:id]` (see [`CacheKey`]) and are stored
//! under `{prefix}:cache:` so invalidation patterns cannot reach other data.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::store::KvStore;

/// Hex characters of the parameter digest kept in a key.
const PARAMS_DIGEST_LEN: usize = 16;

/// Structured cache key: `namespace:operation[:id]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    operation: String,
    id: Option<String>,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            operation: operation.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl fmt::Display) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Identify the entry by a digest of `params`. Object keys are sorted
    /// first, so field order does not matter.
    pub fn with_params<P: Serialize + ?Sized>(mut self, params: &P) -> Self {
        let canonical = serde_json::to_value(params)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
        self.id = Some(digest[..PARAMS_DIGEST_LEN].to_string());
        self
    }

    /// Pattern matching every key of `namespace`.
    pub fn namespace_pattern(namespace: &str) -> String {
        format!("{namespace}:*")
    }

    /// Pattern matching every key of one operation.
    pub fn operation_pattern(namespace: &str, operation: &str) -> String {
        format!("{namespace}:{operation}:*")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.operation)?;
        if let Some(id) = &self.id {
            write!(f, ":{id}")?;
        }
        Ok(())
    }
}

/// Cache counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Store-backed cache. Cheap to clone.
#[derive(Clone)]
pub struct Cache {
    kv: Arc<dyn KvStore>,
    prefix: String,
    stats: Arc<CacheStats>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("prefix", &self.prefix)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl Cache {
    pub fn new(kv: Arc<dyn KvStore>, prefix: &str) -> Self {
        Self {
            kv,
            prefix: format!("{prefix}:cache:"),
            stats: Arc::new(CacheStats::default()),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Raw cached string, or `None` on miss or store failure.
    pub async fn get_raw(&self, key: &str) -> Option<String> {
        match self.kv.get(&self.full_key(key)).await {
            Ok(Some(value)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Cached value, or `None` on miss, store failure, or undecodable value
    /// (which is also dropped).
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "corrupt cache entry dropped");
                if let Err(e) = self.kv.delete(&self.full_key(key)).await {
                    debug!(key, error = %e, "failed to drop corrupt cache entry");
                }
                None
            }
        }
    }

    /// Store a raw string for `ttl`. Best effort; a zero `ttl` is refused.
    pub async fn set_raw(&self, key: &str, value: &str, ttl: Duration) {
        if ttl.is_zero() {
            warn!(key, "refusing to cache without a ttl");
            return;
        }
        match self.kv.set(&self.full_key(key), value, Some(ttl)).await {
            Ok(()) => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "cache write skipped");
            }
        }
    }

    /// Store `value` as JSON for `ttl`. Best effort.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(json) => self.set_raw(key, &json, ttl).await,
            Err(e) => warn!(key, error = %e, "value not serializable, not cached"),
        }
    }

    /// Drop every entry matching `pattern` (`*` wildcards). Best effort;
    /// returns how many entries were removed.
    pub async fn invalidate(&self, pattern: &str) -> u64 {
        match self.kv.delete_matching(&self.full_key(pattern)).await {
            Ok(removed) => {
                debug!(pattern, removed, "cache invalidated");
                removed
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(pattern, error = %e, "cache invalidation skipped");
                0
            }
        }
    }

    /// Cached value for `key`, or the result of `compute` (stored for
    /// `ttl` when it succeeds).
    ///
    /// Concurrent misses may compute more than once.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let value = compute().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }
}
