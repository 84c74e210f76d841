//! Job persistence abstraction.
//!
//! Every method is one atomic step at the store level: two workers racing on
//! `lease` never both get the same job, and `commit`/`renew_lease` only take
//! effect for the worker that currently holds the lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskmill_core::{JobId, WorkerId};

use super::types::{Job, JobState, QueueStats, ReapedJob};
use crate::store::StoreError;

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is {state}, expected {expected}")]
    InvalidState {
        id: JobId,
        state: JobState,
        expected: JobState,
    },
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobStoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, JobStoreError::Store(e) if e.is_unavailable())
    }
}

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Durably record a new pending job. The store assigns `seq`; the stored
    /// record is returned.
    async fn enqueue(&self, job: Job) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Whether `queue` has at least one job eligible at `now`.
    async fn has_ready(&self, queue: &str, now: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// Claim the best eligible pending job of `queue` (highest priority, then
    /// oldest) for `worker_id`, counting one attempt.
    /// Returns None if no jobs are available.
    async fn lease(
        &self,
        queue: &str,
        worker_id: WorkerId,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Extend a lease. Returns `false` if `worker_id` no longer holds it.
    async fn renew_lease(
        &self,
        id: JobId,
        worker_id: WorkerId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Record handler progress. Returns `false` if the lease was lost.
    async fn record_progress(
        &self,
        id: JobId,
        worker_id: WorkerId,
        progress: f64,
    ) -> Result<bool, JobStoreError>;

    /// Persist the outcome of a run (`job` already transitioned out of
    /// `active`) and release the lease.
    ///
    /// Returns `false`, writing nothing, if `worker_id` no longer holds the
    /// lease (it expired and the job was reaped or re-leased).
    async fn commit(&self, job: &Job, worker_id: WorkerId) -> Result<bool, JobStoreError>;

    /// Return jobs of `queue` whose lease expired before `now` to pending
    /// (or dead, if the stalled run was their last attempt).
    async fn reap_expired(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReapedJob>, JobStoreError>;

    /// Delete a job that has not been leased yet. Returns `false` if the job
    /// exists but is not pending.
    async fn remove_pending(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// Dead jobs of `queue`, oldest first.
    async fn list_dead(&self, queue: &str, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Move a dead job back to pending, granting `extra_attempts` more runs.
    async fn requeue_dead(
        &self,
        id: JobId,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Drop completed jobs finished before `completed_before` and dead jobs
    /// finished before `dead_before`. Returns the number of removed jobs.
    async fn purge_finished(
        &self,
        queue: &str,
        completed_before: DateTime<Utc>,
        dead_before: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;

    async fn stats(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueStats, JobStoreError>;

    /// Names of the queues holding jobs in this store, sorted. Covers queues
    /// other processes enqueue to.
    async fn queues(&self) -> Result<Vec<String>, JobStoreError>;
}
