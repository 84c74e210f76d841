//! Key-value store abstraction shared by the queue, cache, rate limiter and
//! scheduler.
//!
//! The store is the single source of truth: every mutation the upper layers
//! need is expressed as one atomic primitive here (conditional set, bounded
//! increment with TTL) or as an atomic job transition on [`JobStore`].
//!
//! Backends:
//! - [`InMemoryStore`]: process-local, for tests/dev
//! - `RedisStore` (feature `redis`): shared across processes

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use tracing::debug;

use crate::jobs::JobStore;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Store-level error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, reset, etc.).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with an error.
    #[error("store command failed: {0}")]
    Command(String),

    /// A stored value could not be encoded/decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the failure is an infrastructure outage (as opposed to a bad
    /// command or bad data).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Outcome of [`KvStore::incr_bounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedIncr {
    /// Counter value after the call (unchanged when not accepted).
    pub count: u64,
    /// Whether the increment was applied (`false` once `max` was reached).
    pub accepted: bool,
    /// Remaining lifetime of the counter key.
    pub ttl_remaining: Duration,
}

/// Minimal set of atomic key-value primitives.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Health check.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set `key`, with an expiry when `ttl` is given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set `key` only if it does not exist. Returns whether the key was set.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Atomically increment a counter unless it already reached `max`.
    ///
    /// The expiry is set on the increment that creates the key and is never
    /// extended afterwards.
    async fn incr_bounded(
        &self,
        key: &str,
        max: u64,
        ttl: Duration,
    ) -> Result<BoundedIncr, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete every key matching `pattern` (see [`KeyPattern`]). Returns the
    /// number of deleted keys.
    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError>;
}

/// One backing store, seen through both of its facets.
///
/// Cache, rate limiter, scheduler and engine all share the same underlying
/// store; this bundles the two trait objects so they can be passed around
/// together.
#[derive(Clone)]
pub struct StoreHandle {
    pub kv: Arc<dyn KvStore>,
    pub jobs: Arc<dyn JobStore>,
}

impl StoreHandle {
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: KvStore + JobStore + 'static,
    {
        Self {
            kv: store.clone(),
            jobs: store,
        }
    }
}

impl core::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}

/// Key pattern in Redis `MATCH` syntax: `*`, `?`, `[abc]`, `[^abc]`,
/// `[a-z]` and backslash escapes.
///
/// Compiled once and reused for every key of a scan. A pattern that does
/// not parse matches only the identical key.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    matcher: Option<GlobMatcher>,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Self {
        let matcher = GlobBuilder::new(&to_glob_syntax(pattern))
            .literal_separator(false)
            .backslash_escape(true)
            .build()
            .map(|glob| glob.compile_matcher());

        let matcher = match matcher {
            Ok(matcher) => Some(matcher),
            Err(e) => {
                debug!(pattern, error = %e, "key pattern does not parse, matching literally");
                None
            }
        };

        Self {
            source: pattern.to_string(),
            matcher,
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match &self.matcher {
            Some(matcher) => matcher.is_match(key),
            None => self.source == key,
        }
    }
}

/// Rewrite the parts of Redis pattern syntax globset reads differently:
/// `[^..]` negation becomes `[!..]` and braces lose their alternation meaning.
fn to_glob_syntax(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push('\\');
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '[' if !in_class => {
                in_class = true;
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('!');
                }
            }
            ']' if in_class => {
                in_class = false;
                out.push(']');
            }
            '{' | '}' if !in_class => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Pattern deletion behaviour every [`KvStore`] backend must share. Keys
/// live under `ns` so a shared server is left untouched.
#[cfg(test)]
pub(crate) async fn check_pattern_deletion(store: &dyn KvStore, ns: &str) {
    for suffix in ["c:a1", "c:b2", "c:c3", "q:x", "q:xy", "lit:*", "lit:any", "brace:{a}"] {
        store.set(&format!("{ns}:{suffix}"), "v", None).await.unwrap();
    }
    let key = |suffix: &str| format!("{ns}:{suffix}");

    assert_eq!(store.delete_matching(&key("c:[ab]*")).await.unwrap(), 2);
    assert!(store.get(&key("c:c3")).await.unwrap().is_some());
    assert_eq!(store.delete_matching(&key("c:[^c]*")).await.unwrap(), 0);

    assert_eq!(store.delete_matching(&key("q:?")).await.unwrap(), 1);
    assert!(store.get(&key("q:xy")).await.unwrap().is_some());

    assert_eq!(store.delete_matching(&key("lit:\\*")).await.unwrap(), 1);
    assert!(store.get(&key("lit:any")).await.unwrap().is_some());

    assert_eq!(store.delete_matching(&key("brace:{a}")).await.unwrap(), 1);

    assert_eq!(store.delete_matching(&key("*")).await.unwrap(), 3);
    assert_eq!(store.get(&key("q:xy")).await.unwrap(), None);
}
