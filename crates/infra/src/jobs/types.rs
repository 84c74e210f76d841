//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use taskmill_core::clock::add_duration;
use taskmill_core::{JobId, WorkerId};

/// Highest accepted priority; lower bound is the negation.
pub const PRIORITY_MAX: i16 = 1000;

/// Width of the insertion-sequence part of a ready score.
///
/// Scores are `(PRIORITY_MAX - priority) * 2^40 + seq`, which stays exact in
/// an f64 (Redis sorted-set scores) for every valid priority.
const SEQ_BITS: u32 = 40;

/// Job lifecycle state.
///
/// `pending --lease--> active --success--> completed`
/// `active --failure, attempts left--> pending` (after backoff)
/// `active --failure, attempts exhausted--> dead`
/// `active --lease expiry--> pending` (re-delivery)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `available_at` and a free worker
    Pending,
    /// Leased by exactly one worker
    Active,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted; held for manual inspection
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0); adds up to `jitter` times the step to the
    /// next attempt's delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let sample = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..1.0)
        } else {
            0.0
        };
        self.delay_with_sample(attempt, sample)
    }

    /// Deterministic core of [`RetryPolicy::delay_for_attempt`]; `sample` in `[0, 1)`
    /// selects the jitter.
    ///
    /// The result never exceeds `max_delay` and never decreases from one
    /// attempt to the next, whatever the samples: jitter only spreads a delay
    /// into the gap below the following attempt's un-jittered delay. That gap
    /// is the delay itself (exponential), `base_delay` (linear) or nothing
    /// (fixed).
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = self.raw_delay_ms(attempt);
        let step_ms = self.raw_delay_ms(attempt.saturating_add(1)) - delay_ms;
        let jitter = self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 0.999_999);
        let jittered = delay_ms + step_ms.max(0.0) * jitter;

        let max_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis(jittered.min(max_ms).max(0.0) as u64)
    }

    fn raw_delay_ms(&self, attempt: u32) -> f64 {
        let base_ms = self.base_delay.as_millis() as f64;
        match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                base_ms * 2_f64.powi(attempt.saturating_sub(1).min(62) as i32)
            }
            BackoffStrategy::Linear => base_ms * (attempt as f64),
        }
    }
}

/// Time-boxed ownership of an active job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: WorkerId,
    pub expires_at: DateTime<Utc>,
}

/// Record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    /// Backoff applied before the next attempt, when one was scheduled.
    pub backoff_ms: Option<u64>,
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Logical queue
    pub queue: String,
    /// Handler discriminator
    pub kind: String,
    /// Opaque handler input
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Execution attempts so far (incremented on lease)
    pub attempt: u32,
    pub max_attempts: u32,
    /// Higher runs first among eligible jobs
    pub priority: i16,
    /// Insertion sequence, assigned by the store at enqueue
    pub seq: u64,
    pub retry_policy: RetryPolicy,
    /// Earliest time the job may be leased
    pub available_at: DateTime<Utc>,
    pub lease: Option<Lease>,
    /// Handler-reported progress (0-100)
    pub progress: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Finished executions (errors and backoffs of previous attempts)
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    /// Create a new pending job, available immediately.
    pub fn new(
        queue: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            kind: kind.into(),
            payload,
            state: JobState::Pending,
            attempt: 0,
            max_attempts: 3,
            priority: 0,
            seq: 0,
            retry_policy: RetryPolicy::default(),
            available_at: now,
            lease: None,
            progress: None,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// At least one attempt is always allowed.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority.clamp(-PRIORITY_MAX, PRIORITY_MAX);
        self
    }

    /// Make the job eligible only after `delay` from its creation time.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.available_at = add_duration(self.created_at, delay);
        self
    }

    /// Check if the job is eligible for leasing.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.available_at <= now
    }

    /// Ordering key among eligible jobs of one queue (lower runs first).
    pub fn ready_score(&self) -> f64 {
        let rank = (PRIORITY_MAX - self.priority.clamp(-PRIORITY_MAX, PRIORITY_MAX)) as u64;
        ((rank << SEQ_BITS) + (self.seq & ((1 << SEQ_BITS) - 1))) as f64
    }

    pub fn is_leased_by(&self, worker_id: WorkerId) -> bool {
        self.state == JobState::Active
            && self.lease.as_ref().is_some_and(|l| l.worker_id == worker_id)
    }

    /// Transition `pending -> active`, counting one attempt.
    pub fn mark_leased(
        &mut self,
        worker_id: WorkerId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.state = JobState::Active;
        self.attempt += 1;
        self.lease = Some(Lease {
            worker_id,
            expires_at,
        });
        self.updated_at = now;
    }

    /// Transition `active -> completed`.
    pub fn mark_completed(
        &mut self,
        result: Option<serde_json::Value>,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.state = JobState::Completed;
        self.lease = None;
        self.result = result;
        self.updated_at = now;
        self.finished_at = Some(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: true,
            error: None,
            backoff_ms: None,
        });
    }

    /// Transition a failed `active` job to `pending` (after backoff) or `dead`.
    ///
    /// `retry_after` overrides the policy delay for this attempt.
    pub fn mark_failed(
        &mut self,
        error: String,
        retry_after: Option<Duration>,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.lease = None;
        self.updated_at = now;
        self.last_error = Some(error.clone());

        let backoff = if self.attempt < self.max_attempts {
            let delay =
                retry_after.unwrap_or_else(|| self.retry_policy.delay_for_attempt(self.attempt));
            self.state = JobState::Pending;
            self.available_at = add_duration(now, delay);
            Some(delay.as_millis() as u64)
        } else {
            self.state = JobState::Dead;
            self.finished_at = Some(now);
            None
        };

        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: false,
            error: Some(error),
            backoff_ms: backoff,
        });
    }

    /// Transition an `active` job whose run was cut short (lease expired or
    /// process shutting down).
    ///
    /// The interrupted run already counted as an attempt when it was leased,
    /// so it is not counted again. Without attempts left the job is dead.
    pub fn mark_interrupted(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.lease = None;
        self.updated_at = now;
        self.last_error = Some(reason.into());

        if self.attempt < self.max_attempts {
            self.state = JobState::Pending;
            self.available_at = now;
        } else {
            self.state = JobState::Dead;
            self.finished_at = Some(now);
        }
    }

    /// Backoff delays recorded so far, oldest first.
    pub fn backoff_delays(&self) -> Vec<Duration> {
        self.history
            .iter()
            .filter_map(|r| r.backoff_ms.map(Duration::from_millis))
            .collect()
    }
}

/// Outcome of reaping one expired lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Returned to pending for re-delivery
    Requeued,
    /// The stalled run was its last attempt
    DeadLettered,
}

/// An expired lease found by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapedJob {
    pub id: JobId,
    pub outcome: ReapOutcome,
}

/// Per-queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub dead: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10))
            .without_jitter();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy =
            RetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.delay_with_sample(3, 0.5), Duration::from_millis(420));
        assert_eq!(policy.delay_with_sample(4, 0.0), Duration::from_millis(500));
        assert_eq!(policy.delay_with_sample(40, 0.99), Duration::from_millis(500));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn linear_jitter_stays_below_next_attempt() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.5,
        };

        let high = policy.delay_with_sample(3, 0.999);
        let low = policy.delay_with_sample(4, 0.0);
        assert!(high >= Duration::from_millis(300));
        assert!(high <= low, "{high:?} > {low:?}");
        assert_eq!(low, Duration::from_millis(400));
    }

    #[test]
    fn fixed_backoff_ignores_jitter() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            jitter: 1.0,
            ..RetryPolicy::fixed(Duration::from_millis(500))
        };

        assert_eq!(policy.delay_with_sample(1, 0.9), Duration::from_millis(500));
        assert_eq!(policy.delay_with_sample(2, 0.0), Duration::from_millis(500));
    }

    fn backoff_strategy() -> impl Strategy<Value = BackoffStrategy> {
        prop_oneof![
            Just(BackoffStrategy::Exponential),
            Just(BackoffStrategy::Linear),
            Just(BackoffStrategy::Fixed),
        ]
    }

    proptest! {
        #[test]
        fn backoff_never_decreases_and_respects_cap(
            base_ms in 1u64..5_000,
            cap_factor in 1u64..200,
            strategy in backoff_strategy(),
            jitter in 0.0f64..=2.0,
            samples in proptest::collection::vec(0.0f64..1.0, 12),
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(base_ms * cap_factor),
                strategy,
                jitter,
            };

            let mut previous = Duration::ZERO;
            for (i, sample) in samples.iter().enumerate() {
                let delay = policy.delay_with_sample(i as u32 + 1, *sample);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }

        #[test]
        fn attempts_never_decrease_and_dead_means_exhausted(
            max_attempts in 1u32..8,
            outcomes in proptest::collection::vec(0u8..3, 1..20),
        ) {
            let t = now();
            let worker = WorkerId::new();
            let mut job = Job::new("q", "k", serde_json::json!({}), t)
                .with_max_attempts(max_attempts)
                .with_retry_policy(RetryPolicy::fixed(Duration::ZERO));

            let mut last_attempt = 0;
            for outcome in outcomes {
                if job.state != JobState::Pending {
                    break;
                }
                job.mark_leased(worker, t, t);
                match outcome {
                    0 => job.mark_failed("boom".into(), None, t, t),
                    1 => job.mark_interrupted("lease expired", t),
                    _ => job.mark_completed(None, t, t),
                }
                prop_assert!(job.attempt >= last_attempt);
                last_attempt = job.attempt;
                if job.state == JobState::Dead {
                    prop_assert_eq!(job.attempt, job.max_attempts);
                }
            }
        }
    }

    #[test]
    fn job_lifecycle() {
        let t = now();
        let mut job = Job::new("mail", "send", serde_json::json!({"key": "value"}), t);

        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt, 0);
        assert!(job.is_ready(t));

        let worker = WorkerId::new();
        job.mark_leased(worker, t + chrono::Duration::seconds(30), t);
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempt, 1);
        assert!(job.is_leased_by(worker));
        assert!(!job.is_leased_by(WorkerId::new()));

        job.mark_completed(Some(serde_json::json!({"sent": true})), t, t);
        assert_eq!(job.state, JobState::Completed);
        assert!(job.lease.is_none());
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
    }

    #[test]
    fn job_failure_and_retry() {
        let t = now();
        let mut job = Job::new("mail", "send", serde_json::json!({}), t)
            .with_max_attempts(2)
            .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(5)));
        let worker = WorkerId::new();

        job.mark_leased(worker, t, t);
        job.mark_failed("error 1".to_string(), None, t, t);

        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.available_at, t + chrono::Duration::seconds(5));
        assert!(!job.is_ready(t));

        job.mark_leased(worker, t, t);
        job.mark_failed("error 2".to_string(), None, t, t);

        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.last_error.as_deref(), Some("error 2"));
        assert_eq!(job.backoff_delays(), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn retry_after_overrides_policy() {
        let t = now();
        let mut job = Job::new("mail", "send", serde_json::json!({}), t);
        job.mark_leased(WorkerId::new(), t, t);
        job.mark_failed("rate limited upstream".into(), Some(Duration::from_secs(42)), t, t);

        assert_eq!(job.available_at, t + chrono::Duration::seconds(42));
    }

    #[test]
    fn interrupted_last_attempt_is_dead() {
        let t = now();
        let mut job = Job::new("mail", "send", serde_json::json!({}), t).with_max_attempts(1);
        job.mark_leased(WorkerId::new(), t, t);
        job.mark_interrupted("lease expired", t);

        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempt, 1);
    }

    #[test]
    fn ready_score_orders_by_priority_then_insertion() {
        let t = now();
        let mut low_old = Job::new("q", "k", serde_json::json!({}), t);
        low_old.seq = 1;
        let mut low_new = Job::new("q", "k", serde_json::json!({}), t);
        low_new.seq = 2;
        let mut high = Job::new("q", "k", serde_json::json!({}), t).with_priority(10);
        high.seq = 3;

        assert!(low_old.ready_score() < low_new.ready_score());
        assert!(high.ready_score() < low_old.ready_score());
    }

    #[test]
    fn priority_is_clamped() {
        let job = Job::new("q", "k", serde_json::json!({}), now()).with_priority(i16::MAX);
        assert_eq!(job.priority, PRIORITY_MAX);
    }
}
