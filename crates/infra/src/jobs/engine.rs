//! Queue engine: handler registry, producers' entry point and worker pool
//! lifecycle.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use taskmill_core::clock::add_duration;
use taskmill_core::{JobId, SharedClock, SystemClock, WorkerId};

use super::handler::{HandlerOptions, JobHandler};
use super::store::JobStoreError;
use super::types::{Job, QueueStats, ReapOutcome, ReapedJob, RetryPolicy};
use super::worker::Worker;
use crate::config::EngineConfig;
use crate::rate_limit::RateLimiter;
use crate::store::StoreHandle;

/// Engine error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    /// The store did not confirm the write in time; the job may or may not
    /// have been recorded.
    #[error("enqueue timed out after {0:?}")]
    Timeout(Duration),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl EngineError {
    pub fn is_unavailable(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_unavailable(),
            EngineError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Per-job options for [`Engine::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Not eligible before `now + delay`
    pub delay: Option<Duration>,
    /// Higher runs first (clamped to ±1000)
    pub priority: i16,
    pub max_attempts: Option<u32>,
    pub backoff: Option<RetryPolicy>,
}

impl EnqueueOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// What [`Engine::shutdown`] had to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every task stopped within the grace period
    pub drained: bool,
    /// Interrupted jobs returned to pending
    pub released: usize,
    /// Interrupted jobs that were on their last attempt
    pub dead_lettered: usize,
}

#[derive(Clone)]
pub(crate) struct RegisteredHandler {
    pub(crate) handler: Arc<dyn JobHandler>,
    pub(crate) options: HandlerOptions,
}

struct QueueRegistration {
    /// Options of the first registration; they size the pool
    pool: HandlerOptions,
    handlers: HashMap<String, RegisteredHandler>,
    running: bool,
}

struct EngineInner {
    store: StoreHandle,
    clock: SharedClock,
    config: EngineConfig,
    limiter: Arc<RateLimiter>,
    registry: RwLock<HashMap<String, QueueRegistration>>,
    known_queues: RwLock<BTreeSet<String>>,
    active: Mutex<HashMap<JobId, (WorkerId, Job)>>,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
    initialized: AtomicBool,
}

/// The queue engine.
///
/// Owns the `(queue, kind) -> handler` registry and the worker pools of this
/// process. Cheap to clone; producers hold a clone and call
/// [`Engine::enqueue`].
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("initialized", &self.inner.initialized.load(Ordering::SeqCst))
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(store: StoreHandle, config: EngineConfig, limiter: Arc<RateLimiter>) -> Self {
        Self::with_clock(store, config, limiter, SystemClock::shared())
    }

    pub fn with_clock(
        store: StoreHandle,
        config: EngineConfig,
        limiter: Arc<RateLimiter>,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                clock,
                config,
                limiter,
                registry: RwLock::new(HashMap::new()),
                known_queues: RwLock::new(BTreeSet::new()),
                active: Mutex::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
                cancel: CancellationToken::new(),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn store(&self) -> &StoreHandle {
        &self.inner.store
    }

    pub(crate) fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// Fires when shutdown begins.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Register the handler for `(queue, kind)`.
    ///
    /// The first registration on a queue decides its pool size and rate
    /// limit. The pool starts now if the engine is initialized, otherwise in
    /// [`Engine::initialize`]. Re-registering a kind replaces its handler.
    pub fn register_handler<H>(
        &self,
        queue: impl Into<String>,
        kind: impl Into<String>,
        handler: H,
        options: HandlerOptions,
    ) -> Result<(), EngineError>
    where
        H: JobHandler,
    {
        let queue = queue.into();
        let kind = kind.into();
        validate_name("queue", &queue)?;
        validate_name("kind", &kind)?;
        if options.concurrency == 0 {
            return Err(EngineError::InvalidOptions(format!(
                "concurrency for queue `{queue}` must be at least 1"
            )));
        }
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }

        let start_pool = {
            let mut registry = self.inner.registry.write().unwrap();
            let entry = registry
                .entry(queue.clone())
                .or_insert_with(|| QueueRegistration {
                    pool: options.clone(),
                    handlers: HashMap::new(),
                    running: false,
                });

            if entry.pool.concurrency != options.concurrency
                || entry.pool.rate_limit != options.rate_limit
            {
                warn!(
                    queue = %queue,
                    kind = %kind,
                    "pool options differ from the queue's first registration; keeping the first"
                );
            }

            entry.handlers.insert(
                kind.clone(),
                RegisteredHandler {
                    handler: Arc::new(handler),
                    options,
                },
            );

            if self.inner.initialized.load(Ordering::SeqCst) && !entry.running {
                entry.running = true;
                Some(entry.pool.clone())
            } else {
                None
            }
        };

        self.inner.known_queues.write().unwrap().insert(queue.clone());
        debug!(queue = %queue, kind = %kind, "handler registered");

        if let Some(pool) = start_pool {
            self.spawn_pool(&queue, &pool);
        }
        Ok(())
    }

    /// Start background work: the reaper and the pools of every queue
    /// registered so far. Idempotent.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.inner.store.kv.ping().await {
            self.inner.initialized.store(false, Ordering::SeqCst);
            return Err(EngineError::Store(e.into()));
        }

        let pools: Vec<(String, HandlerOptions)> = {
            let mut registry = self.inner.registry.write().unwrap();
            registry
                .iter_mut()
                .filter(|(_, entry)| !entry.running)
                .map(|(queue, entry)| {
                    entry.running = true;
                    (queue.clone(), entry.pool.clone())
                })
                .collect()
        };
        for (queue, pool) in &pools {
            self.spawn_pool(queue, pool);
        }

        let engine = self.clone();
        self.spawn_background(async move { engine.reaper_loop().await });

        info!(queues = pools.len(), "engine initialized");
        Ok(())
    }

    /// Record a job durably and return its id. Does not wait for execution.
    ///
    /// Fails with [`EngineError::Timeout`] when the store does not answer
    /// within `enqueue_timeout`.
    #[instrument(skip(self, payload, options), err)]
    pub async fn enqueue(
        &self,
        queue: &str,
        kind: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, EngineError> {
        validate_name("queue", queue)?;
        validate_name("kind", kind)?;
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }

        let defaults = self.handler_for(queue, kind).map(|h| h.options);
        let max_attempts = options
            .max_attempts
            .or_else(|| defaults.as_ref().and_then(|o| o.max_attempts))
            .unwrap_or(self.inner.config.default_max_attempts);
        let retry = options
            .backoff
            .or_else(|| defaults.as_ref().and_then(|o| o.retry.clone()))
            .unwrap_or_else(|| self.inner.config.default_retry.clone());

        let mut job = Job::new(queue, kind, payload, self.inner.clock.now())
            .with_priority(options.priority)
            .with_max_attempts(max_attempts)
            .with_retry_policy(retry);
        if let Some(delay) = options.delay {
            job = job.delayed(delay);
        }

        let timeout = self.inner.config.enqueue_timeout;
        let stored = match tokio::time::timeout(timeout, self.inner.store.jobs.enqueue(job)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(queue, kind, timeout_ms = timeout.as_millis() as u64, "enqueue timed out");
                return Err(EngineError::Timeout(timeout));
            }
        };

        self.inner.known_queues.write().unwrap().insert(queue.to_string());
        debug!(queue, kind, job_id = %stored.id, "job enqueued");
        Ok(stored.id)
    }

    /// Stop leasing, wait up to `grace` for running handlers, then return
    /// every job still in flight to pending.
    ///
    /// Must complete before the store connection is closed.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        info!(grace_ms = grace.as_millis() as u64, "engine shutting down");
        self.inner.cancel.cancel();

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(remaining = tasks.len(), "grace period elapsed, aborting in-flight handlers");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let leftovers: Vec<(WorkerId, Job)> = self
            .inner
            .active
            .lock()
            .unwrap()
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        let mut report = ShutdownReport {
            drained,
            ..ShutdownReport::default()
        };
        for (worker_id, mut job) in leftovers {
            job.mark_interrupted("interrupted by shutdown", self.inner.clock.now());
            match self.inner.store.jobs.commit(&job, worker_id).await {
                Ok(true) if job.state.is_terminal() => {
                    warn!(
                        job_id = %job.id,
                        queue = %job.queue,
                        "interrupted job was on its last attempt, moved to dead"
                    );
                    report.dead_lettered += 1;
                }
                Ok(true) => report.released += 1,
                Ok(false) => debug!(job_id = %job.id, "lease already lost, nothing to release"),
                Err(e) => warn!(
                    job_id = %job.id,
                    error = %e,
                    "failed to release job; it returns after lease expiry"
                ),
            }
        }

        info!(
            drained = report.drained,
            released = report.released,
            dead_lettered = report.dead_lettered,
            "engine stopped"
        );
        report
    }

    /// Run a background task tied to the engine's lifetime. It must stop
    /// when [`Engine::cancellation`] fires; it is aborted after the grace
    /// period otherwise.
    pub fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            return;
        }
        self.inner.tasks.lock().unwrap().spawn(task);
    }

    /// One reaper pass over every known queue: expired leases go back to
    /// pending (or dead), and old finished jobs are purged.
    pub async fn run_maintenance(&self) -> Result<Vec<ReapedJob>, EngineError> {
        let now = self.inner.clock.now();
        let cutoff =
            |retention: Duration| now - chrono::Duration::from_std(retention).unwrap_or_default();
        let completed_before = cutoff(self.inner.config.completed_retention);
        let dead_before = cutoff(self.inner.config.dead_retention);

        let mut reaped = Vec::new();
        for queue in self.all_queues().await? {
            for job in self.inner.store.jobs.reap_expired(&queue, now).await? {
                match job.outcome {
                    ReapOutcome::Requeued => {
                        info!(queue = %queue, job_id = %job.id, "lease expired, job requeued")
                    }
                    ReapOutcome::DeadLettered => warn!(
                        queue = %queue,
                        job_id = %job.id,
                        "lease expired on last attempt, job moved to dead"
                    ),
                }
                reaped.push(job);
            }

            let purged = self
                .inner
                .store
                .jobs
                .purge_finished(&queue, completed_before, dead_before)
                .await?;
            if purged > 0 {
                debug!(queue = %queue, purged, "purged finished jobs");
            }
        }
        Ok(reaped)
    }

    async fn reaper_loop(self) {
        let token = self.cancellation();
        let mut interval = tokio::time::interval(self.inner.config.reaper_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_maintenance().await {
                        warn!(error = %e, "reaper pass failed");
                    }
                }
            }
        }
        debug!("reaper stopped");
    }

    fn spawn_pool(&self, queue: &str, pool: &HandlerOptions) {
        info!(
            queue,
            concurrency = pool.concurrency,
            rate_limited = pool.rate_limit.is_some(),
            "starting worker pool"
        );
        for _ in 0..pool.concurrency {
            let worker = Worker::new(self.clone(), queue.to_string(), pool.rate_limit);
            self.spawn_background(worker.run());
        }
    }

    pub(crate) fn handler_for(&self, queue: &str, kind: &str) -> Option<RegisteredHandler> {
        self.inner
            .registry
            .read()
            .unwrap()
            .get(queue)
            .and_then(|entry| entry.handlers.get(kind).cloned())
    }

    pub(crate) fn track_active(&self, worker_id: WorkerId, job: &Job) {
        self.inner
            .active
            .lock()
            .unwrap()
            .insert(job.id, (worker_id, job.clone()));
    }

    pub(crate) fn untrack_active(&self, id: JobId) {
        self.inner.active.lock().unwrap().remove(&id);
    }

    /// Jobs currently running in this process.
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.inner.active.lock().unwrap().keys().copied().collect()
    }

    /// Queues with a registered handler or enqueued through this engine.
    pub fn queues(&self) -> Vec<String> {
        self.inner.known_queues.read().unwrap().iter().cloned().collect()
    }

    /// [`Engine::queues`] together with every queue the store holds jobs
    /// for, including queues only other processes enqueue to.
    pub async fn all_queues(&self) -> Result<Vec<String>, EngineError> {
        let mut queues: BTreeSet<String> =
            self.inner.store.jobs.queues().await?.into_iter().collect();
        queues.extend(self.queues());
        Ok(queues.into_iter().collect())
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>, EngineError> {
        Ok(self.inner.store.jobs.get_job(id).await?)
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats, EngineError> {
        Ok(self.inner.store.jobs.stats(queue, self.inner.clock.now()).await?)
    }

    pub async fn dead_jobs(&self, queue: &str, limit: usize) -> Result<Vec<Job>, EngineError> {
        Ok(self.inner.store.jobs.list_dead(queue, limit).await?)
    }

    /// Give a dead job `extra_attempts` more runs.
    pub async fn requeue_dead(&self, id: JobId, extra_attempts: u32) -> Result<Job, EngineError> {
        let job = self
            .inner
            .store
            .jobs
            .requeue_dead(id, extra_attempts, self.inner.clock.now())
            .await?;
        info!(
            job_id = %id,
            queue = %job.queue,
            max_attempts = job.max_attempts,
            "dead job requeued"
        );
        Ok(job)
    }

    /// Remove a job that has not started. Returns `false` if it already left
    /// pending (running jobs cannot be cancelled).
    pub async fn remove(&self, id: JobId) -> Result<bool, EngineError> {
        let removed = self.inner.store.jobs.remove_pending(id).await?;
        if removed {
            info!(job_id = %id, "pending job removed");
        }
        Ok(removed)
    }

    /// Lease expiry for a lease taken at `now`.
    pub(crate) fn lease_expiry(&self) -> chrono::DateTime<chrono::Utc> {
        add_duration(self.inner.clock.now(), self.inner.config.lease_ttl)
    }
}

fn validate_name(what: &str, name: &str) -> Result<(), EngineError> {
    if name.is_empty() || name.contains(char::is_whitespace) || name.contains(['*', '?', ':']) {
        return Err(EngineError::InvalidOptions(format!("invalid {what} name `{name}`")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::handler::{HandlerError, JobContext, JobOutput};
    use crate::jobs::types::JobState;
    use crate::rate_limit::RateLimit;
    use crate::store::InMemoryStore;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(5),
            reaper_interval: Duration::from_millis(20),
            lease_ttl: Duration::from_millis(300),
            default_retry: RetryPolicy::fixed(Duration::from_millis(5)),
            ..EngineConfig::default()
        }
    }

    fn engine_on(store: Arc<InMemoryStore>, config: EngineConfig) -> Engine {
        let limiter = Arc::new(RateLimiter::new(store.clone(), SystemClock::shared(), "test"));
        Engine::new(StoreHandle::new(store), config, limiter)
    }

    async fn wait_for_state(engine: &Engine, id: JobId, state: JobState) -> Job {
        for _ in 0..400 {
            if let Some(job) = engine.job(id).await.unwrap() {
                if job.state == state {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {state}");
    }

    #[tokio::test]
    async fn enqueue_records_pending_job_with_defaults() {
        let engine = engine_on(InMemoryStore::arc(), fast_config());
        engine
            .register_handler(
                "mail",
                "send",
                |_ctx: JobContext| async { Ok::<_, HandlerError>(JobOutput::empty()) },
                HandlerOptions::default().with_max_attempts(5),
            )
            .unwrap();

        let with_handler = engine
            .enqueue("mail", "send", serde_json::json!({"to": "a@b.c"}), EnqueueOptions::default())
            .await
            .unwrap();
        let without_handler = engine
            .enqueue(
                "mail",
                "digest",
                serde_json::json!({}),
                EnqueueOptions::default().with_priority(9),
            )
            .await
            .unwrap();

        let job = engine.job(with_handler).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.max_attempts, 5);

        let job = engine.job(without_handler).await.unwrap().unwrap();
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.priority, 9);
        assert_eq!(engine.queues(), vec!["mail".to_string()]);
    }

    #[tokio::test]
    async fn enqueue_surfaces_store_outage() {
        let store = InMemoryStore::arc();
        let engine = engine_on(store.clone(), fast_config());
        store.set_available(false);

        let err = engine
            .enqueue("mail", "send", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn invalid_registrations_are_rejected() {
        let engine = engine_on(InMemoryStore::arc(), fast_config());
        let noop = |_ctx: JobContext| async { Ok::<_, HandlerError>(JobOutput::empty()) };

        assert!(matches!(
            engine.register_handler("q", "k", noop, HandlerOptions::default().with_concurrency(0)),
            Err(EngineError::InvalidOptions(_))
        ));
        assert!(matches!(
            engine.register_handler("bad:queue", "k", noop, HandlerOptions::default()),
            Err(EngineError::InvalidOptions(_))
        ));
    }

    #[tokio::test]
    async fn successful_job_completes_with_result_and_progress() {
        let engine = engine_on(InMemoryStore::arc(), fast_config());
        engine
            .register_handler(
                "index",
                "document",
                |ctx: JobContext| async move {
                    ctx.progress.report(40.0);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let indexed = serde_json::json!({"indexed": ctx.payload["doc"]});
                    Ok::<_, HandlerError>(JobOutput::value(indexed))
                },
                HandlerOptions::default(),
            )
            .unwrap();
        engine.initialize().await.unwrap();

        let id = engine
            .enqueue("index", "document", serde_json::json!({"doc": 7}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = wait_for_state(&engine, id, JobState::Completed).await;

        assert_eq!(job.attempt, 1);
        assert_eq!(job.result, Some(serde_json::json!({"indexed": 7})));
        assert_eq!(job.progress, Some(40.0));
        assert!(job.lease.is_none());

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn poison_job_lands_in_dead_set() {
        let engine = engine_on(InMemoryStore::arc(), fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        engine
            .register_handler(
                "files",
                "upload",
                move |_ctx: JobContext| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Err::<JobOutput, _>(HandlerError::failed("bucket missing"))
                    }
                },
                HandlerOptions::default().with_max_attempts(3),
            )
            .unwrap();
        engine.initialize().await.unwrap();

        let id = engine
            .enqueue("files", "upload", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = wait_for_state(&engine, id, JobState::Dead).await;

        assert_eq!(job.attempt, 3);
        assert_eq!(job.attempt, job.max_attempts);
        assert_eq!(job.last_error.as_deref(), Some("bucket missing"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.dead_jobs("files", 10).await.unwrap().len(), 1);

        let requeued = engine.requeue_dead(id, 1).await.unwrap();
        assert_eq!(requeued.max_attempts, 4);
        let job = wait_for_state(&engine, id, JobState::Dead).await;
        assert_eq!(job.attempt, 4);

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn panics_and_timeouts_are_failures() {
        let engine = engine_on(InMemoryStore::arc(), fast_config());
        engine
            .register_handler(
                "misc",
                "panic",
                |_ctx: JobContext| async move {
                    if true {
                        panic!("handler exploded");
                    }
                    Ok::<_, HandlerError>(JobOutput::empty())
                },
                HandlerOptions::default().with_max_attempts(1),
            )
            .unwrap();
        engine
            .register_handler(
                "misc",
                "slow",
                |_ctx: JobContext| async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, HandlerError>(JobOutput::empty())
                },
                HandlerOptions::default()
                    .with_max_attempts(1)
                    .with_timeout(Duration::from_millis(20)),
            )
            .unwrap();
        engine.initialize().await.unwrap();

        let panicking = engine
            .enqueue("misc", "panic", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let slow = engine
            .enqueue("misc", "slow", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let job = wait_for_state(&engine, panicking, JobState::Dead).await;
        assert!(job.last_error.unwrap().contains("handler exploded"));
        let job = wait_for_state(&engine, slow, JobState::Dead).await;
        assert!(job.last_error.unwrap().contains("timed out"));

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unknown_kind_fails_instead_of_stalling() {
        let engine = engine_on(InMemoryStore::arc(), fast_config());
        engine
            .register_handler(
                "q",
                "known",
                |_ctx: JobContext| async { Ok::<_, HandlerError>(JobOutput::empty()) },
                HandlerOptions::default(),
            )
            .unwrap();
        engine.initialize().await.unwrap();

        let id = engine
            .enqueue(
                "q",
                "unknown",
                serde_json::json!({}),
                EnqueueOptions::default().with_max_attempts(1),
            )
            .await
            .unwrap();
        let job = wait_for_state(&engine, id, JobState::Dead).await;
        assert!(job.last_error.unwrap().contains("no handler"));

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn pool_rate_limit_throttles_leasing_not_enqueue() {
        let engine = engine_on(InMemoryStore::arc(), fast_config());
        engine
            .register_handler(
                "emails",
                "send",
                |_ctx: JobContext| async { Ok::<_, HandlerError>(JobOutput::empty()) },
                HandlerOptions::default()
                    .with_concurrency(2)
                    .with_rate_limit(RateLimit::new(2, Duration::from_secs(3600)).unwrap()),
            )
            .unwrap();
        engine.initialize().await.unwrap();

        for _ in 0..5 {
            engine
                .enqueue("emails", "send", serde_json::json!({}), EnqueueOptions::default())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = engine.stats("emails").await.unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.pending, 3);

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn remove_only_touches_pending_jobs() {
        let engine = engine_on(InMemoryStore::arc(), fast_config());
        let id = engine
            .enqueue(
                "q",
                "k",
                serde_json::json!({}),
                EnqueueOptions::default().with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        assert!(engine.remove(id).await.unwrap());
        assert!(engine.job(id).await.unwrap().is_none());
        assert!(matches!(
            engine.remove(id).await,
            Err(EngineError::Store(JobStoreError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn initialize_is_idempotent_and_shutdown_rejects_new_work() {
        let engine = engine_on(InMemoryStore::arc(), fast_config());
        engine.initialize().await.unwrap();
        engine.initialize().await.unwrap();

        let report = engine.shutdown(Duration::from_millis(200)).await;
        assert!(report.drained);
        assert_eq!(report.released, 0);

        assert_eq!(
            engine
                .enqueue("q", "k", serde_json::json!({}), EnqueueOptions::default())
                .await,
            Err(EngineError::ShuttingDown)
        );
        assert_eq!(engine.initialize().await, Err(EngineError::ShuttingDown));
    }
}
