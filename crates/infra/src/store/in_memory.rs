//! In-memory store for tests/dev.
//!
//! Holds both key-value entries and jobs behind one lock each, so every
//! trait method is atomic with respect to every other. Several engines
//! sharing one `Arc<InMemoryStore>` behave like several processes sharing one
//! store.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskmill_core::clock::{add_duration, duration_between};
use taskmill_core::{JobId, SharedClock, SystemClock, WorkerId};

use super::{BoundedIncr, KeyPattern, KvStore, StoreError};
use crate::jobs::{Job, JobState, JobStore, JobStoreError, QueueStats, ReapOutcome, ReapedJob};

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Entry count at which a write first sweeps expired keys.
const KV_PRUNE_THRESHOLD: usize = 1024;

/// Expired entries are dropped lazily by `get` and in bulk once the table
/// grows past `prune_at`, so keys that are never read again (rate limit
/// windows, scheduler locks) do not accumulate.
#[derive(Debug)]
struct KvTable {
    entries: HashMap<String, KvEntry>,
    prune_at: usize,
}

impl KvTable {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            prune_at: KV_PRUNE_THRESHOLD,
        }
    }

    fn insert(&mut self, key: &str, entry: KvEntry, now: DateTime<Utc>) {
        if self.entries.len() >= self.prune_at && !self.entries.contains_key(key) {
            self.entries.retain(|_, e| e.is_live(now));
            // Next sweep once the live set doubles.
            self.prune_at = (self.entries.len() * 2).max(KV_PRUNE_THRESHOLD);
        }
        self.entries.insert(key.to_string(), entry);
    }

    fn live(&self, key: &str, now: DateTime<Utc>) -> Option<&KvEntry> {
        self.entries.get(key).filter(|e| e.is_live(now))
    }
}

#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
    next_seq: u64,
}

/// In-memory key-value and job store.
#[derive(Debug)]
pub struct InMemoryStore {
    clock: SharedClock,
    kv: Mutex<KvTable>,
    jobs: Mutex<JobTable>,
    available: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// TTLs are evaluated against `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            kv: Mutex::new(KvTable::new()),
            jobs: Mutex::new(JobTable::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of key-value entries held, expired ones included.
    #[cfg(test)]
    pub(crate) fn kv_len(&self) -> usize {
        self.kv.lock().unwrap().entries.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".to_string()))
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut kv = self.kv.lock().unwrap();
        match kv.entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                kv.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let entry = KvEntry {
            value: value.to_string(),
            expires_at: ttl.map(|t| add_duration(now, t)),
        };
        self.kv.lock().unwrap().insert(key, entry, now);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut kv = self.kv.lock().unwrap();
        if kv.live(key, now).is_some() {
            return Ok(false);
        }
        let entry = KvEntry {
            value: value.to_string(),
            expires_at: Some(add_duration(now, ttl)),
        };
        kv.insert(key, entry, now);
        Ok(true)
    }

    async fn incr_bounded(
        &self,
        key: &str,
        max: u64,
        ttl: Duration,
    ) -> Result<BoundedIncr, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut kv = self.kv.lock().unwrap();

        let (current, expires_at) = match kv.live(key, now) {
            Some(entry) => {
                let count = entry.value.parse::<u64>().map_err(|e| {
                    StoreError::Command(format!("value at {key} is not a counter: {e}"))
                })?;
                (count, entry.expires_at)
            }
            None => (0, Some(add_duration(now, ttl))),
        };

        let ttl_remaining = expires_at.map_or(ttl, |at| duration_between(now, at));

        if current >= max {
            return Ok(BoundedIncr {
                count: current,
                accepted: false,
                ttl_remaining,
            });
        }

        let count = current + 1;
        let entry = KvEntry {
            value: count.to_string(),
            expires_at,
        };
        kv.insert(key, entry, now);

        Ok(BoundedIncr {
            count,
            accepted: true,
            ttl_remaining,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.kv.lock().unwrap().entries.remove(key).is_some())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let pattern = KeyPattern::new(pattern);
        let mut kv = self.kv.lock().unwrap();
        let before = kv.entries.len();
        kv.entries.retain(|key, _| !pattern.matches(key));
        Ok((before - kv.entries.len()) as u64)
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn enqueue(&self, mut job: Job) -> Result<Job, JobStoreError> {
        self.check_available()?;
        let mut table = self.jobs.lock().unwrap();
        if table.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        table.next_seq += 1;
        job.seq = table.next_seq;
        table.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.check_available()?;
        Ok(self.jobs.lock().unwrap().jobs.get(&id).cloned())
    }

    async fn has_ready(&self, queue: &str, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        self.check_available()?;
        let table = self.jobs.lock().unwrap();
        Ok(table
            .jobs
            .values()
            .any(|j| j.queue == queue && j.is_ready(now)))
    }

    async fn lease(
        &self,
        queue: &str,
        worker_id: WorkerId,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.check_available()?;
        let mut table = self.jobs.lock().unwrap();

        // Best eligible job: highest priority, then oldest insertion.
        let next = table
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.is_ready(now))
            .min_by(|a, b| a.ready_score().total_cmp(&b.ready_score()))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let job = table
            .jobs
            .get_mut(&id)
            .ok_or(JobStoreError::NotFound(id))?;
        job.mark_leased(worker_id, add_duration(now, lease_ttl), now);
        Ok(Some(job.clone()))
    }

    async fn renew_lease(
        &self,
        id: JobId,
        worker_id: WorkerId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        self.check_available()?;
        let mut table = self.jobs.lock().unwrap();
        match table.jobs.get_mut(&id) {
            Some(job) if job.is_leased_by(worker_id) => {
                if let Some(lease) = job.lease.as_mut() {
                    lease.expires_at = expires_at;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_progress(
        &self,
        id: JobId,
        worker_id: WorkerId,
        progress: f64,
    ) -> Result<bool, JobStoreError> {
        self.check_available()?;
        let mut table = self.jobs.lock().unwrap();
        match table.jobs.get_mut(&id) {
            Some(job) if job.is_leased_by(worker_id) => {
                job.progress = Some(progress);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(&self, job: &Job, worker_id: WorkerId) -> Result<bool, JobStoreError> {
        self.check_available()?;
        let mut table = self.jobs.lock().unwrap();
        match table.jobs.get_mut(&job.id) {
            Some(stored) if stored.is_leased_by(worker_id) => {
                let progress = stored.progress;
                *stored = job.clone();
                stored.lease = None;
                stored.progress = progress.or(job.progress);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    async fn reap_expired(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReapedJob>, JobStoreError> {
        self.check_available()?;
        let mut table = self.jobs.lock().unwrap();
        let mut reaped = Vec::new();

        for job in table.jobs.values_mut() {
            let expired = job.queue == queue
                && job.state == JobState::Active
                && job.lease.as_ref().is_some_and(|l| l.expires_at <= now);
            if !expired {
                continue;
            }

            job.mark_interrupted("lease expired", now);
            let outcome = if job.state == JobState::Dead {
                ReapOutcome::DeadLettered
            } else {
                ReapOutcome::Requeued
            };
            reaped.push(ReapedJob { id: job.id, outcome });
        }

        Ok(reaped)
    }

    async fn remove_pending(&self, id: JobId) -> Result<bool, JobStoreError> {
        self.check_available()?;
        let mut table = self.jobs.lock().unwrap();
        match table.jobs.get(&id) {
            Some(job) if job.state == JobState::Pending => {
                table.jobs.remove(&id);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(id)),
        }
    }

    async fn list_dead(&self, queue: &str, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.check_available()?;
        let table = self.jobs.lock().unwrap();
        let mut result: Vec<_> = table
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.state == JobState::Dead)
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.finished_at, j.seq));
        result.truncate(limit);
        Ok(result)
    }

    async fn requeue_dead(
        &self,
        id: JobId,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.check_available()?;
        let mut table = self.jobs.lock().unwrap();
        let job = table.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        if job.state != JobState::Dead {
            return Err(JobStoreError::InvalidState {
                id,
                state: job.state,
                expected: JobState::Dead,
            });
        }

        job.state = JobState::Pending;
        job.max_attempts = job.attempt + extra_attempts.max(1);
        job.available_at = now;
        job.finished_at = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn purge_finished(
        &self,
        queue: &str,
        completed_before: DateTime<Utc>,
        dead_before: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        self.check_available()?;
        let mut table = self.jobs.lock().unwrap();
        let before = table.jobs.len();

        table.jobs.retain(|_, job| {
            if job.queue != queue {
                return true;
            }
            let finished = job.finished_at.unwrap_or(job.updated_at);
            match job.state {
                JobState::Completed => finished >= completed_before,
                JobState::Dead => finished >= dead_before,
                _ => true,
            }
        });

        Ok((before - table.jobs.len()) as u64)
    }

    async fn stats(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueStats, JobStoreError> {
        self.check_available()?;
        let table = self.jobs.lock().unwrap();
        let mut stats = QueueStats::default();

        for job in table.jobs.values().filter(|j| j.queue == queue) {
            match job.state {
                JobState::Pending if job.available_at > now => stats.delayed += 1,
                JobState::Pending => stats.pending += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Dead => stats.dead += 1,
            }
        }

        Ok(stats)
    }

    async fn queues(&self) -> Result<Vec<String>, JobStoreError> {
        self.check_available()?;
        let table = self.jobs.lock().unwrap();
        let queues: BTreeSet<&str> = table.jobs.values().map(|j| j.queue.as_str()).collect();
        Ok(queues.into_iter().map(str::to_string).collect())
    }
}
