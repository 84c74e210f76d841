//! Work-distribution subsystem: durable job queue with worker pools, retry
//! and dead-lettering, recurring triggers, and the cache and rate-limit
//! layers sharing the same key-value store.

pub mod cache;
pub mod config;
pub mod jobs;
pub mod rate_limit;
pub mod scheduler;
pub mod store;

mod integration_tests;

pub use cache::{Cache, CacheKey};
pub use config::{Config, ConfigError, EngineConfig};
pub use jobs::{
    Engine, EngineError, EnqueueOptions, HandlerError, HandlerOptions, JobContext, JobOutput,
};
pub use rate_limit::{RateLimit, RateLimitDecision, RateLimiter};
pub use scheduler::{Cadence, ScheduledJobDefinition, Scheduler};
pub use store::{InMemoryStore, KvStore, StoreError, StoreHandle};
