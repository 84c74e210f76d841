//! Lease loop: one per unit of a queue's concurrency.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, info, warn};

use taskmill_core::WorkerId;

use super::engine::{Engine, RegisteredHandler};
use super::handler::{HandlerError, JobContext, JobOutput, ProgressReporter};
use super::store::JobStoreError;
use super::types::{Job, JobState};
use crate::rate_limit::RateLimit;

const STORE_BACKOFF_MIN: Duration = Duration::from_millis(100);
const STORE_BACKOFF_MAX: Duration = Duration::from_secs(5);
const COMMIT_ATTEMPTS: u32 = 3;

enum Step {
    /// Nothing eligible
    Idle,
    /// Pool rate limit exhausted for this long
    Throttled(Duration),
    Processed,
}

/// Exponential pause after store errors, reset by the next success.
struct StoreBackoff {
    next: Duration,
}

impl StoreBackoff {
    fn new() -> Self {
        Self {
            next: STORE_BACKOFF_MIN,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(STORE_BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = STORE_BACKOFF_MIN;
    }
}

pub(crate) struct Worker {
    engine: Engine,
    queue: String,
    id: WorkerId,
    rate_limit: Option<RateLimit>,
    rate_key: String,
}

impl Worker {
    pub(crate) fn new(engine: Engine, queue: String, rate_limit: Option<RateLimit>) -> Self {
        let rate_key = format!("queue:{queue}");
        Self {
            engine,
            queue,
            id: WorkerId::new(),
            rate_limit,
            rate_key,
        }
    }

    pub(crate) async fn run(self) {
        debug!(queue = %self.queue, worker_id = %self.id, "lease loop started");
        let token = self.engine.cancellation();
        let mut backoff = StoreBackoff::new();

        while !token.is_cancelled() {
            let pause = match self.step().await {
                Ok(Step::Processed) => {
                    backoff.reset();
                    continue;
                }
                Ok(Step::Idle) => {
                    backoff.reset();
                    self.engine.config().poll_interval
                }
                Ok(Step::Throttled(wait)) => wait,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        queue = %self.queue,
                        worker_id = %self.id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "store error in lease loop"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!(queue = %self.queue, worker_id = %self.id, "lease loop stopped");
    }

    async fn step(&self) -> Result<Step, JobStoreError> {
        let jobs = &self.engine.store().jobs;
        let clock = self.engine.clock();

        if !jobs.has_ready(&self.queue, clock.now()).await? {
            return Ok(Step::Idle);
        }

        // Tokens are only spent when there is work; a lost lease race still
        // costs one.
        if let Some(limit) = &self.rate_limit {
            let decision = self.engine.limiter().check(&self.rate_key, limit).await;
            if !decision.allowed {
                debug!(
                    queue = %self.queue,
                    retry_after_ms = decision.retry_after.as_millis() as u64,
                    "pool throttled"
                );
                return Ok(Step::Throttled(decision.retry_after.max(Duration::from_millis(1))));
            }
        }

        let lease_ttl = self.engine.config().lease_ttl;
        let Some(job) = jobs.lease(&self.queue, self.id, lease_ttl, clock.now()).await? else {
            return Ok(Step::Idle);
        };

        self.process(job).await;
        Ok(Step::Processed)
    }

    async fn process(&self, mut job: Job) {
        let started = self.engine.clock().now();
        self.engine.track_active(self.id, &job);
        debug!(
            queue = %job.queue,
            kind = %job.kind,
            job_id = %job.id,
            attempt = job.attempt,
            "job leased"
        );

        let outcome = match self.engine.handler_for(&job.queue, &job.kind) {
            Some(registered) => self.supervise(&job, registered).await,
            None => Err(HandlerError::failed(format!(
                "no handler registered for kind `{}` on queue `{}`",
                job.kind, job.queue
            ))),
        };

        let now = self.engine.clock().now();
        match outcome {
            Ok(output) => job.mark_completed(output.result, started, now),
            Err(HandlerError::Failed(message)) => job.mark_failed(message, None, started, now),
            Err(HandlerError::RetryAfter { reason, delay }) => {
                job.mark_failed(reason, Some(delay), started, now)
            }
        }

        self.commit(&job).await;
        self.engine.untrack_active(job.id);
    }

    /// Run the handler while renewing the lease and forwarding progress.
    async fn supervise(
        &self,
        job: &Job,
        registered: RegisteredHandler,
    ) -> Result<JobOutput, HandlerError> {
        let (reporter, mut progress) = ProgressReporter::channel();
        let ctx = JobContext::new(job, reporter);
        let timeout = registered.options.timeout;
        let handler = registered.handler;

        let run = async move {
            let guarded = AssertUnwindSafe(handler.handle(ctx)).catch_unwind();
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, guarded).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(HandlerError::failed(format!(
                            "handler timed out after {limit:?}"
                        )));
                    }
                },
                None => guarded.await,
            };
            result.unwrap_or_else(|panic| Err(HandlerError::failed(panic_message(panic))))
        };
        tokio::pin!(run);

        let lease_ttl = self.engine.config().lease_ttl;
        let renew_every = (lease_ttl / 3).max(Duration::from_millis(10));
        let first_renewal = tokio::time::Instant::now() + renew_every;
        let mut renew = tokio::time::interval_at(first_renewal, renew_every);
        let mut progress_open = true;
        let mut forwarded: Option<f64> = None;

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = renew.tick() => self.renew(job).await,
                changed = progress.changed(), if progress_open => match changed {
                    Ok(()) => {
                        let latest = *progress.borrow_and_update();
                        self.forward_progress(job, latest).await;
                        forwarded = latest;
                    }
                    Err(_) => progress_open = false,
                },
            }
        };

        // A report made right before the handler returned.
        let latest = *progress.borrow();
        if latest != forwarded {
            self.forward_progress(job, latest).await;
        }
        outcome
    }

    async fn renew(&self, job: &Job) {
        let expires_at = self.engine.lease_expiry();
        match self.engine.store().jobs.renew_lease(job.id, self.id, expires_at).await {
            Ok(true) => {}
            Ok(false) => warn!(
                job_id = %job.id,
                queue = %job.queue,
                "lease lost while handler still running"
            ),
            Err(e) => warn!(job_id = %job.id, error = %e, "lease renewal failed"),
        }
    }

    async fn forward_progress(&self, job: &Job, latest: Option<f64>) {
        let Some(progress) = latest else {
            return;
        };
        if let Err(e) = self
            .engine
            .store()
            .jobs
            .record_progress(job.id, self.id, progress)
            .await
        {
            debug!(job_id = %job.id, error = %e, "progress not recorded");
        }
    }

    /// Persist the outcome, retrying briefly on store errors. If it never
    /// lands, the lease expires and the job is delivered again.
    async fn commit(&self, job: &Job) {
        let mut backoff = StoreBackoff::new();
        for attempt in 1..=COMMIT_ATTEMPTS {
            match self.engine.store().jobs.commit(job, self.id).await {
                Ok(true) => {
                    log_outcome(job);
                    return;
                }
                Ok(false) => {
                    warn!(
                        job_id = %job.id,
                        queue = %job.queue,
                        "lease lost before commit; outcome discarded, job was redelivered"
                    );
                    return;
                }
                Err(e) if attempt < COMMIT_ATTEMPTS => {
                    warn!(job_id = %job.id, error = %e, attempt, "commit failed, retrying");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(e) => {
                    warn!(
                        job_id = %job.id,
                        error = %e,
                        "commit failed; job returns after lease expiry"
                    );
                }
            }
        }
    }
}

fn log_outcome(job: &Job) {
    match job.state {
        JobState::Completed => debug!(
            job_id = %job.id,
            queue = %job.queue,
            kind = %job.kind,
            attempt = job.attempt,
            "job completed"
        ),
        JobState::Pending => info!(
            job_id = %job.id,
            queue = %job.queue,
            kind = %job.kind,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            error = job.last_error.as_deref().unwrap_or_default(),
            available_at = %job.available_at,
            "job failed, retry scheduled"
        ),
        JobState::Dead => warn!(
            job_id = %job.id,
            queue = %job.queue,
            kind = %job.kind,
            attempt = job.attempt,
            error = job.last_error.as_deref().unwrap_or_default(),
            "job exhausted its attempts, moved to dead"
        ),
        JobState::Active => {}
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    format!("handler panicked: {detail}")
}
