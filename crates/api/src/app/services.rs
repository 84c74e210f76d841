//! Infrastructure wiring: one store shared by the engine, scheduler, cache
//! and rate limiter.

use std::sync::Arc;

use tracing::warn;

use taskmill_infra::{Cache, Config, Engine, InMemoryStore, RateLimiter, Scheduler, StoreHandle};

/// Everything the HTTP layer and the binary need.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub config: Config,
    pub engine: Engine,
    pub scheduler: Scheduler,
    pub cache: Cache,
    pub limiter: Arc<RateLimiter>,
    /// `"redis"` or `"memory"`, reported by `/health`
    pub backend: &'static str,
}

impl AppServices {
    /// Wire every component over `store`.
    pub fn from_store(store: StoreHandle, config: Config, backend: &'static str) -> Self {
        let prefix = config.store.key_prefix.clone();
        let limiter = Arc::new(RateLimiter::new(
            store.kv.clone(),
            taskmill_core::SystemClock::shared(),
            prefix.clone(),
        ));
        let cache = Cache::new(store.kv.clone(), &prefix);
        let engine = Engine::new(store, config.engine.clone(), limiter.clone());
        let scheduler = Scheduler::new(engine.clone(), prefix, config.scheduler.lock_ttl);

        Self {
            config,
            engine,
            scheduler,
            cache,
            limiter,
            backend,
        }
    }

    /// Process-local services (dev/test).
    pub fn in_memory(config: Config) -> Self {
        Self::from_store(StoreHandle::new(InMemoryStore::arc()), config, "memory")
    }
}

/// Connect the configured store. Without a Redis URL the in-memory store is
/// used, which only coordinates workers inside this process.
pub async fn build_services(config: Config) -> anyhow::Result<AppServices> {
    match config.store.redis_url.clone() {
        #[cfg(feature = "redis")]
        Some(url) => {
            let prefix = config.store.key_prefix.clone();
            let store = taskmill_infra::store::RedisStore::connect(&url, prefix).await?;
            Ok(AppServices::from_store(StoreHandle::new(Arc::new(store)), config, "redis"))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("TASKMILL_REDIS_URL ignored: built without the `redis` feature");
            Ok(AppServices::in_memory(config))
        }
        None => {
            warn!("TASKMILL_REDIS_URL not set; using in-memory store (single process only)");
            Ok(AppServices::in_memory(config))
        }
    }
}
