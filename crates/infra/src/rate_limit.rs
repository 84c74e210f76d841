//! Fixed-window rate limiter.
//!
//! Counters live in the shared store under `{prefix}:rl:{key}:{window_start_ms}`
//! and are bumped with [`KvStore::incr_bounded`], so a stored count never
//! exceeds the limit. While the store is unreachable the limiter keeps
//! process-local windows instead: less precise across processes, but requests
//! and workers keep flowing.
//!
//! Used both by the HTTP middleware (per client) and by worker pools (per
//! queue, throttling leasing only).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{info, warn};

use taskmill_core::SharedClock;
use taskmill_core::clock::{add_duration, duration_between};

use crate::store::KvStore;

/// Local windows kept before stale ones are pruned.
const LOCAL_PRUNE_THRESHOLD: usize = 1024;

/// Invalid rate limit configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit window must be non-zero")]
    ZeroWindow,
}

/// `max` events per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u64,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max: u64, window: Duration) -> Result<Self, RateLimitError> {
        if window.is_zero() {
            return Err(RateLimitError::ZeroWindow);
        }
        Ok(Self { max, window })
    }

    pub fn per_second(max: u64) -> Self {
        Self {
            max,
            window: Duration::from_secs(1),
        }
    }

    pub fn per_minute(max: u64) -> Self {
        Self {
            max,
            window: Duration::from_secs(60),
        }
    }
}

/// Result of [`RateLimiter::allow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    /// Calls still accepted in the current window
    pub remaining: u64,
    /// When the current window rolls over
    pub reset_at: DateTime<Utc>,
    /// Zero when allowed, otherwise time until `reset_at`
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Process-local fallback counters, keyed like the store counters.
#[derive(Debug, Default)]
struct LocalWindows {
    windows: HashMap<String, LocalWindow>,
}

impl LocalWindows {
    fn incr_bounded(
        &mut self,
        key: &str,
        max: u64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> (u64, bool) {
        if self.windows.len() >= LOCAL_PRUNE_THRESHOLD {
            self.windows.retain(|_, w| w.expires_at > now);
        }

        let window = self
            .windows
            .entry(key.to_string())
            .or_insert(LocalWindow { count: 0, expires_at });

        if window.count >= max {
            (window.count, false)
        } else {
            window.count += 1;
            (window.count, true)
        }
    }
}

/// Shared rate limiter.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    clock: SharedClock,
    prefix: String,
    local: Mutex<LocalWindows>,
    degraded: AtomicBool,
}

impl core::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("prefix", &self.prefix)
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, clock: SharedClock, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            clock,
            prefix: prefix.into(),
            local: Mutex::new(LocalWindows::default()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Count one event for `key` against `limit` per `window`.
    ///
    /// The `limit`-th call of a window is allowed, the next is not, and a
    /// call after the window rolls over is allowed again. A zero `limit`
    /// rejects everything.
    pub async fn allow(&self, key: &str, limit: u64, window: Duration) -> RateLimitDecision {
        let now = self.clock.now();
        let window = window.max(Duration::from_millis(1));
        let window_ms = window.as_millis() as i64;
        let now_ms = now.timestamp_millis();
        let window_start_ms = now_ms - now_ms.rem_euclid(window_ms);
        let window_start = Utc
            .timestamp_millis_opt(window_start_ms)
            .single()
            .unwrap_or(now);
        let reset_at = add_duration(window_start, window);

        if limit == 0 {
            return RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
                retry_after: duration_between(now, reset_at),
            };
        }

        let store_key = format!("{}:rl:{}:{}", self.prefix, key, window_start_ms);

        let (count, allowed) = match self.kv.incr_bounded(&store_key, limit, window).await {
            Ok(incr) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!("rate limiter store reachable again");
                }
                (incr.count, incr.accepted)
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    warn!(error = %e, "rate limiter falling back to local counters");
                }
                self.local
                    .lock()
                    .unwrap()
                    .incr_bounded(&store_key, limit, reset_at, now)
            }
        };

        RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
            retry_after: if allowed {
                Duration::ZERO
            } else {
                duration_between(now, reset_at)
            },
        }
    }

    /// [`RateLimiter::allow`] with a configured [`RateLimit`].
    pub async fn check(&self, key: &str, limit: &RateLimit) -> RateLimitDecision {
        self.allow(key, limit.max, limit.window).await
    }

    /// Whether the last store call failed and local counters are in use.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}
