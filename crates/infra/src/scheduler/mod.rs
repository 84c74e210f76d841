//! Recurring job triggers with cluster-wide single fire.
//!
//! Every process registers the same static definitions and ticks on its own
//! timer. For a due occurrence `o` of definition `id`, each ticking process
//! races to create `{prefix}:sched:{id}:{o_millis}` with a conditional set;
//! only the winner enqueues. The winner then records `o` under
//! `{prefix}:sched:{id}:last`, which moves every process past it.

pub mod cadence;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, instrument, warn};

use taskmill_core::{JobId, SharedClock};

use crate::jobs::{Engine, EnqueueOptions};
use crate::store::{KvStore, StoreError};

pub use cadence::{Cadence, next_occurrence};

/// Scheduler error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("interval must be at least one millisecond")]
    InvalidInterval,

    #[error("definition `{0}` is already registered")]
    DuplicateDefinition(String),

    #[error("invalid definition id `{0}`")]
    InvalidId(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A recurring job.
#[derive(Debug, Clone)]
pub struct ScheduledJobDefinition {
    /// Stable name; every process must use the same one
    pub id: String,
    pub cadence: Cadence,
    pub queue: String,
    pub kind: String,
    /// Payload of each fired job; objects also get `scheduled_for`
    pub payload_template: serde_json::Value,
    pub options: EnqueueOptions,
}

impl ScheduledJobDefinition {
    pub fn new(
        id: impl Into<String>,
        cadence: Cadence,
        queue: impl Into<String>,
        kind: impl Into<String>,
        payload_template: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            cadence,
            queue: queue.into(),
            kind: kind.into(),
            payload_template,
            options: EnqueueOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }

    fn payload_for(&self, occurrence: DateTime<Utc>) -> serde_json::Value {
        let mut payload = self.payload_template.clone();
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert(
                "scheduled_for".to_string(),
                serde_json::Value::String(occurrence.to_rfc3339()),
            );
        }
        payload
    }
}

/// A job enqueued by a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredOccurrence {
    pub definition: String,
    pub occurrence: DateTime<Utc>,
    pub job_id: JobId,
}

/// Result of one [`Scheduler::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<FiredOccurrence>,
    /// Due, but another process claimed the occurrence
    pub skipped_locked: usize,
    pub not_due: usize,
    /// Store or enqueue failures; retried next tick
    pub failed: usize,
}

struct Registered {
    definition: ScheduledJobDefinition,
    registered_at: DateTime<Utc>,
}

struct SchedulerInner {
    engine: Engine,
    kv: Arc<dyn KvStore>,
    clock: SharedClock,
    prefix: String,
    lock_ttl: Duration,
    definitions: RwLock<Vec<Arc<Registered>>>,
}

/// Recurring trigger runner. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("prefix", &self.inner.prefix)
            .field("definitions", &self.definition_ids())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Scheduler enqueueing through `engine`, sharing its store and clock.
    pub fn new(engine: Engine, prefix: impl Into<String>, lock_ttl: Duration) -> Self {
        let kv = engine.store().kv.clone();
        let clock = engine.clock().clone();
        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                kv,
                clock,
                prefix: prefix.into(),
                lock_ttl,
                definitions: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Add a static definition. Its first due occurrence is the first one
    /// after now, unless a previous run already recorded progress.
    pub fn register_recurring(
        &self,
        definition: ScheduledJobDefinition,
    ) -> Result<(), ScheduleError> {
        if definition.id.is_empty() || definition.id.contains([':', '*', '?']) {
            return Err(ScheduleError::InvalidId(definition.id));
        }

        let mut definitions = self.inner.definitions.write().unwrap();
        if definitions.iter().any(|r| r.definition.id == definition.id) {
            return Err(ScheduleError::DuplicateDefinition(definition.id));
        }

        info!(
            definition = %definition.id,
            cadence = %definition.cadence,
            queue = %definition.queue,
            kind = %definition.kind,
            "recurring job registered"
        );
        definitions.push(Arc::new(Registered {
            definition,
            registered_at: self.inner.clock.now(),
        }));
        Ok(())
    }

    pub fn definition_ids(&self) -> Vec<String> {
        self.inner
            .definitions
            .read()
            .unwrap()
            .iter()
            .map(|r| r.definition.id.clone())
            .collect()
    }

    /// Last occurrence fired for `id`, by any process.
    pub async fn last_triggered(&self, id: &str) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let raw = self.inner.kv.get(&self.last_key(id)).await?;
        Ok(raw
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }

    /// Evaluate every definition at the current time.
    pub async fn tick(&self) -> TickReport {
        self.tick_at(self.inner.clock.now()).await
    }

    /// Evaluate every definition as of `now`.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let definitions: Vec<Arc<Registered>> = self.inner.definitions.read().unwrap().clone();
        let mut report = TickReport::default();

        for registered in definitions {
            match self.evaluate(&registered, now).await {
                Ok(Evaluation::Fired(fired)) => report.fired.push(fired),
                Ok(Evaluation::Locked) => report.skipped_locked += 1,
                Ok(Evaluation::NotDue) => report.not_due += 1,
                Err(reason) => {
                    warn!(
                        definition = %registered.definition.id,
                        error = %reason,
                        "scheduled trigger failed, retrying next tick"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn evaluate(
        &self,
        registered: &Registered,
        now: DateTime<Utc>,
    ) -> Result<Evaluation, String> {
        let definition = &registered.definition;
        let last = self.last_triggered(&definition.id).await.map_err(|e| e.to_string())?;
        let reference = last.unwrap_or(registered.registered_at);

        let Some(occurrence) = definition.cadence.latest_occurrence(reference, now) else {
            return Ok(Evaluation::NotDue);
        };

        let lock_key = format!(
            "{}:sched:{}:{}",
            self.inner.prefix,
            definition.id,
            occurrence.timestamp_millis()
        );
        let claimed = self
            .inner
            .kv
            .set_if_absent(&lock_key, &now.timestamp_millis().to_string(), self.inner.lock_ttl)
            .await
            .map_err(|e| e.to_string())?;
        if !claimed {
            debug!(
                definition = %definition.id,
                occurrence = %occurrence,
                "occurrence claimed elsewhere"
            );
            return Ok(Evaluation::Locked);
        }

        let enqueued = self
            .inner
            .engine
            .enqueue(
                &definition.queue,
                &definition.kind,
                definition.payload_for(occurrence),
                definition.options.clone(),
            )
            .await;

        let job_id = match enqueued {
            Ok(id) => id,
            Err(e) => {
                // Release the claim so this or another process can retry.
                if let Err(release) = self.inner.kv.delete(&lock_key).await {
                    warn!(
                        definition = %definition.id,
                        error = %release,
                        "failed to release occurrence lock"
                    );
                }
                return Err(e.to_string());
            }
        };

        if let Err(e) = self
            .inner
            .kv
            .set(
                &self.last_key(&definition.id),
                &occurrence.timestamp_millis().to_string(),
                None,
            )
            .await
        {
            // The lock still prevents a second fire until it expires.
            warn!(definition = %definition.id, error = %e, "failed to record last trigger");
        }

        info!(
            definition = %definition.id,
            occurrence = %occurrence,
            job_id = %job_id,
            "scheduled job enqueued"
        );
        Ok(Evaluation::Fired(FiredOccurrence {
            definition: definition.id.clone(),
            occurrence,
            job_id,
        }))
    }

    /// Tick every `interval` until the engine shuts down.
    pub fn spawn(&self, interval: Duration) {
        let scheduler = self.clone();
        let token = self.inner.engine.cancellation();
        self.inner.engine.spawn_background(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        let report = scheduler.tick().await;
                        if !report.fired.is_empty() || report.failed > 0 {
                            debug!(
                                fired = report.fired.len(),
                                skipped_locked = report.skipped_locked,
                                failed = report.failed,
                                "scheduler tick"
                            );
                        }
                    }
                }
            }
            debug!("scheduler stopped");
        });
    }

    fn last_key(&self, id: &str) -> String {
        format!("{}:sched:{}:last", self.inner.prefix, id)
    }
}

enum Evaluation {
    Fired(FiredOccurrence),
    Locked,
    NotDue,
}
