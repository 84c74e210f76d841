//! Runtime configuration.
//!
//! Every setting has a default; [`Config::from_env`] overrides individual
//! values from `TASKMILL_*` environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::RetryPolicy;
use crate::rate_limit::RateLimit;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: `{value}` ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// `None` selects the in-memory store (single process, dev only).
    pub redis_url: Option<String>,
    /// Namespace for every key the subsystem writes
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "taskmill".to_string(),
        }
    }
}

/// Queue engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Upper bound on a producer's `enqueue` call
    pub enqueue_timeout: Duration,
    /// Lease length; renewed every third of it while a handler runs
    pub lease_ttl: Duration,
    /// Idle sleep of a lease loop that found nothing to do
    pub poll_interval: Duration,
    pub reaper_interval: Duration,
    pub shutdown_grace: Duration,
    pub completed_retention: Duration,
    pub dead_retention: Duration,
    pub default_max_attempts: u32,
    pub default_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enqueue_timeout: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            reaper_interval: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(10),
            completed_retention: Duration::from_secs(60 * 60),
            dead_retention: Duration::from_secs(7 * 24 * 60 * 60),
            default_max_attempts: 3,
            default_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
        }
    }
}

/// Inbound (HTTP) throttling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: RateLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: RateLimit::per_minute(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Lifetime of an occurrence lock
    pub lock_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub addr: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Complete process configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub scheduler: SchedulerConfig,
    pub http: HttpConfig,
}

impl Config {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup` (absent or blank values keep the default).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Config::default();

        if let Some(url) = get("TASKMILL_REDIS_URL") {
            config.store.redis_url = Some(url);
        }
        if let Some(prefix) = get("TASKMILL_KEY_PREFIX") {
            config.store.key_prefix = prefix;
        }

        let engine = &mut config.engine;
        override_millis(&get, "TASKMILL_ENQUEUE_TIMEOUT_MS", &mut engine.enqueue_timeout)?;
        override_millis(&get, "TASKMILL_LEASE_TTL_MS", &mut engine.lease_ttl)?;
        override_millis(&get, "TASKMILL_POLL_INTERVAL_MS", &mut engine.poll_interval)?;
        override_millis(&get, "TASKMILL_REAPER_INTERVAL_MS", &mut engine.reaper_interval)?;
        override_millis(&get, "TASKMILL_SHUTDOWN_GRACE_MS", &mut engine.shutdown_grace)?;
        if let Some(raw) = get("TASKMILL_DEFAULT_MAX_ATTEMPTS") {
            let attempts = parse::<u32>("TASKMILL_DEFAULT_MAX_ATTEMPTS", &raw)?;
            engine.default_max_attempts = attempts.max(1);
        }
        if engine.lease_ttl.is_zero() {
            return Err(invalid("TASKMILL_LEASE_TTL_MS", "0", "must be positive"));
        }

        override_millis(&get, "TASKMILL_SCHEDULER_TICK_MS", &mut config.scheduler.tick_interval)?;
        if config.scheduler.tick_interval.is_zero() {
            return Err(invalid("TASKMILL_SCHEDULER_TICK_MS", "0", "must be positive"));
        }

        if let Some(raw) = get("TASKMILL_CACHE_DEFAULT_TTL_SECS") {
            let secs = parse::<u64>("TASKMILL_CACHE_DEFAULT_TTL_SECS", &raw)?;
            if secs == 0 {
                return Err(invalid("TASKMILL_CACHE_DEFAULT_TTL_SECS", &raw, "must be positive"));
            }
            config.cache.default_ttl = Duration::from_secs(secs);
        }

        if let Some(raw) = get("TASKMILL_RATE_LIMIT_MAX") {
            config.rate_limit.limit.max = parse("TASKMILL_RATE_LIMIT_MAX", &raw)?;
        }
        if let Some(raw) = get("TASKMILL_RATE_LIMIT_WINDOW_MS") {
            let window = Duration::from_millis(parse("TASKMILL_RATE_LIMIT_WINDOW_MS", &raw)?);
            config.rate_limit.limit = RateLimit::new(config.rate_limit.limit.max, window)
                .map_err(|e| invalid("TASKMILL_RATE_LIMIT_WINDOW_MS", &raw, &e.to_string()))?;
        }

        if let Some(raw) = get("TASKMILL_HTTP_ADDR") {
            config.http.addr = parse("TASKMILL_HTTP_ADDR", &raw)?;
        }

        Ok(config)
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| invalid(key, raw, &e.to_string()))
}

fn override_millis<G>(get: &G, key: &str, target: &mut Duration) -> Result<(), ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *target = Duration::from_millis(parse(key, &raw)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.engine.enqueue_timeout, Duration::from_secs(5));
        assert!(config.store.redis_url.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            ("TASKMILL_REDIS_URL", "redis://cache:6379"),
            ("TASKMILL_KEY_PREFIX", "jobs"),
            ("TASKMILL_LEASE_TTL_MS", "1500"),
            ("TASKMILL_RATE_LIMIT_MAX", "7"),
            ("TASKMILL_RATE_LIMIT_WINDOW_MS", "2000"),
            ("TASKMILL_HTTP_ADDR", "127.0.0.1:9000"),
            ("TASKMILL_CACHE_DEFAULT_TTL_SECS", "  "),
        ]))
        .unwrap();

        assert_eq!(config.store.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.store.key_prefix, "jobs");
        assert_eq!(config.engine.lease_ttl, Duration::from_millis(1500));
        assert_eq!(config.rate_limit.limit, RateLimit::new(7, Duration::from_secs(2)).unwrap());
        assert_eq!(config.http.addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.cache.default_ttl, Duration::from_secs(60));
    }

    #[test]
    fn malformed_values_are_reported() {
        let invalid_key = |pairs: &[(&str, &str)]| match Config::from_lookup(lookup(pairs)) {
            Err(ConfigError::Invalid { key, .. }) => key,
            other => panic!("expected an invalid value error, got {other:?}"),
        };

        assert_eq!(
            invalid_key(&[("TASKMILL_POLL_INTERVAL_MS", "soon")]),
            "TASKMILL_POLL_INTERVAL_MS"
        );
        assert_eq!(
            invalid_key(&[("TASKMILL_RATE_LIMIT_WINDOW_MS", "0")]),
            "TASKMILL_RATE_LIMIT_WINDOW_MS"
        );
    }
}
