//! Handler contract between business logic and the engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use taskmill_core::JobId;

use super::types::{Job, RetryPolicy};
use crate::rate_limit::RateLimit;

/// What a handler returns on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutput {
    pub result: Option<serde_json::Value>,
}

impl JobOutput {
    /// Success without a result value.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn value(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
        }
    }
}

impl From<serde_json::Value> for JobOutput {
    fn from(value: serde_json::Value) -> Self {
        Self::value(value)
    }
}

/// Handler failure. Every variant counts as an attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// Retry according to the job's retry policy.
    #[error("{0}")]
    Failed(String),

    /// Retry after `delay` instead of the policy delay.
    #[error("{reason} (retry after {delay:?})")]
    RetryAfter { reason: String, delay: Duration },
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    pub fn retry_after(reason: impl Into<String>, delay: Duration) -> Self {
        HandlerError::RetryAfter {
            reason: reason.into(),
            delay,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Failed(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Failed(format!("invalid payload: {err}"))
    }
}

/// Write side of a job's progress channel.
///
/// Only the latest value matters; the worker persists it while the handler
/// is still running.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<Option<f64>>>,
}

impl ProgressReporter {
    pub(crate) fn channel() -> (Self, watch::Receiver<Option<f64>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Report progress as a percentage (clamped to 0-100).
    pub fn report(&self, percent: f64) {
        if percent.is_nan() {
            return;
        }
        // The receiver is gone once the run is over; nothing to do then.
        let _ = self.tx.send(Some(percent.clamp(0.0, 100.0)));
    }
}

/// Everything a handler sees of the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    pub kind: String,
    /// 1-based attempt number of this run
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: serde_json::Value,
    pub progress: ProgressReporter,
}

impl JobContext {
    pub(crate) fn new(job: &Job, progress: ProgressReporter) -> Self {
        Self {
            job_id: job.id,
            queue: job.queue.clone(),
            kind: job.kind.clone(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            payload: job.payload.clone(),
            progress,
        }
    }

    /// Deserialize the payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Business logic for one `(queue, kind)`.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> Result<JobOutput, HandlerError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobOutput, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<JobOutput, HandlerError> {
        (self)(ctx).await
    }
}

/// Registration options.
///
/// `concurrency` and `rate_limit` configure the queue's worker pool and are
/// taken from the first registration on that queue; the rest apply per kind.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Lease loops run for the queue
    pub concurrency: usize,
    /// Throughput ceiling for leasing (never blocks producers)
    pub rate_limit: Option<RateLimit>,
    /// Per-run timeout; unbounded when `None`
    pub timeout: Option<Duration>,
    /// Default for jobs enqueued without an explicit `max_attempts`
    pub max_attempts: Option<u32>,
    /// Default for jobs enqueued without an explicit backoff
    pub retry: Option<RetryPolicy>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            rate_limit: None,
            timeout: None,
            max_attempts: None,
            retry: None,
        }
    }
}

impl HandlerOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}
