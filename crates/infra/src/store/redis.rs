//! Redis-backed store (shared across processes).
//!
//! ## Layout
//!
//! All keys live under a configurable prefix (default `taskmill`):
//!
//! - `{prefix}:job:{id}`: job hash (scalar fields, JSON for payload/result/history)
//! - `{prefix}:q:{queue}:ready`: eligible jobs, scored by priority then insertion
//! - `{prefix}:q:{queue}:delayed`: jobs waiting for `available_at` (score = ms)
//! - `{prefix}:q:{queue}:active`: leased jobs (score = lease expiry ms)
//! - `{prefix}:q:{queue}:completed` / `:dead`: finished jobs (score = finish ms)
//! - `{prefix}:queues`: set of queue names seen by `enqueue`
//! - `{prefix}:seq`: insertion counter
//!
//! Every job transition (lease, renew, commit, reap, requeue) is a Lua
//! script, so each is a single atomic step on the server.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{info, instrument};

use taskmill_core::{JobId, WorkerId};

use super::{BoundedIncr, KvStore, StoreError};
use crate::jobs::types::PRIORITY_MAX;
use crate::jobs::{
    Job, JobState, JobStore, JobStoreError, Lease, QueueStats, ReapOutcome, ReapedJob,
};

const LEASE_LUA: &str = include_str!("lua/lease.lua");
const RENEW_LUA: &str = include_str!("lua/renew.lua");
const PROGRESS_LUA: &str = include_str!("lua/progress.lua");
const COMMIT_LUA: &str = include_str!("lua/commit.lua");
const REAP_LUA: &str = include_str!("lua/reap.lua");
const REMOVE_PENDING_LUA: &str = include_str!("lua/remove_pending.lua");
const REQUEUE_DEAD_LUA: &str = include_str!("lua/requeue_dead.lua");
const PURGE_LUA: &str = include_str!("lua/purge.lua");
const INCR_BOUNDED_LUA: &str = include_str!("lua/incr_bounded.lua");

/// Multiplier separating the priority rank from the insertion sequence.
const SEQ_MULTIPLIER: u64 = 1 << 40;

/// Keys scanned per `SCAN` round trip in `delete_matching`.
const SCAN_BATCH: usize = 500;

const REAP_REASON: &str = "lease expired";

fn map_redis_err(err: redis::RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, JobStoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| JobStoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

/// Redis store.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    lease_script: Script,
    renew_script: Script,
    progress_script: Script,
    commit_script: Script,
    reap_script: Script,
    remove_pending_script: Script,
    requeue_dead_script: Script,
    purge_script: Script,
    incr_bounded_script: Script,
}

impl core::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Namespace for every key written by this store
    pub async fn connect(
        redis_url: impl AsRef<str>,
        prefix: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client).await.map_err(map_redis_err)?;
        let prefix = prefix.into();

        info!(prefix = %prefix, "connected to redis");

        Ok(Self::with_connection(conn, prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            lease_script: Script::new(LEASE_LUA),
            renew_script: Script::new(RENEW_LUA),
            progress_script: Script::new(PROGRESS_LUA),
            commit_script: Script::new(COMMIT_LUA),
            reap_script: Script::new(REAP_LUA),
            remove_pending_script: Script::new(REMOVE_PENDING_LUA),
            requeue_dead_script: Script::new(REQUEUE_DEAD_LUA),
            purge_script: Script::new(PURGE_LUA),
            incr_bounded_script: Script::new(INCR_BOUNDED_LUA),
        }
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn queue_key(&self, queue: &str, set: &str) -> String {
        format!("{}:q:{}:{}", self.prefix, queue, set)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.prefix)
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.job_key(id))
            .await
            .map_err(map_redis_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(fields).map(Some)
    }
}

/// Flatten a job into hash fields. `None` is stored as an empty string.
fn encode_job(job: &Job) -> Result<Vec<(&'static str, String)>, JobStoreError> {
    let json = |v: &serde_json::Value| serde_json::to_string(v);
    let ser = |e: serde_json::Error| JobStoreError::Store(StoreError::Serialization(e.to_string()));

    let mut fields = encode_outcome(job)?;
    fields.extend([
        ("id", job.id.to_string()),
        ("queue", job.queue.clone()),
        ("kind", job.kind.clone()),
        ("payload", json(&job.payload).map_err(ser)?),
        ("max_attempts", job.max_attempts.to_string()),
        ("priority", job.priority.to_string()),
        ("seq", job.seq.to_string()),
        ("retry", serde_json::to_string(&job.retry_policy).map_err(ser)?),
        ("progress", job.progress.map(|p| p.to_string()).unwrap_or_default()),
        ("created_at", to_millis(job.created_at).to_string()),
    ]);
    Ok(fields)
}

/// Fields a run outcome may change (written by `commit`).
fn encode_outcome(job: &Job) -> Result<Vec<(&'static str, String)>, JobStoreError> {
    let ser = |e: serde_json::Error| JobStoreError::Store(StoreError::Serialization(e.to_string()));

    Ok(vec![
        ("state", job.state.as_str().to_string()),
        ("attempt", job.attempt.to_string()),
        ("available_at", to_millis(job.available_at).to_string()),
        (
            "result",
            match &job.result {
                Some(v) => serde_json::to_string(v).map_err(ser)?,
                None => String::new(),
            },
        ),
        ("last_error", job.last_error.clone().unwrap_or_default()),
        ("updated_at", to_millis(job.updated_at).to_string()),
        (
            "finished_at",
            job.finished_at.map(|t| to_millis(t).to_string()).unwrap_or_default(),
        ),
        ("history", serde_json::to_string(&job.history).map_err(ser)?),
    ])
}

fn decode_job(mut fields: HashMap<String, String>) -> Result<Job, JobStoreError> {
    fn take(fields: &mut HashMap<String, String>, name: &str) -> Result<String, JobStoreError> {
        fields
            .remove(name)
            .ok_or_else(|| JobStoreError::Corrupt(format!("missing field `{name}`")))
    }
    fn optional(fields: &mut HashMap<String, String>, name: &str) -> Option<String> {
        fields.remove(name).filter(|v| !v.is_empty())
    }
    fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, JobStoreError>
    where
        T::Err: std::fmt::Display,
    {
        raw.parse::<T>()
            .map_err(|e| JobStoreError::Corrupt(format!("field `{name}`: {e}")))
    }
    fn json<T: serde::de::DeserializeOwned>(name: &str, raw: &str) -> Result<T, JobStoreError> {
        serde_json::from_str(raw)
            .map_err(|e| JobStoreError::Corrupt(format!("field `{name}`: {e}")))
    }

    let id: JobId = parse("id", &take(&mut fields, "id")?)?;
    let state_raw = take(&mut fields, "state")?;
    let state = JobState::parse(&state_raw)
        .ok_or_else(|| JobStoreError::Corrupt(format!("unknown state `{state_raw}`")))?;

    let lease = match (
        optional(&mut fields, "lease_worker"),
        optional(&mut fields, "lease_expires_at"),
    ) {
        (Some(worker), Some(expires)) => Some(Lease {
            worker_id: parse::<WorkerId>("lease_worker", &worker)?,
            expires_at: from_millis(parse("lease_expires_at", &expires)?)?,
        }),
        _ => None,
    };

    Ok(Job {
        id,
        queue: take(&mut fields, "queue")?,
        kind: take(&mut fields, "kind")?,
        payload: json("payload", &take(&mut fields, "payload")?)?,
        state,
        attempt: parse("attempt", &take(&mut fields, "attempt")?)?,
        max_attempts: parse("max_attempts", &take(&mut fields, "max_attempts")?)?,
        priority: parse("priority", &take(&mut fields, "priority")?)?,
        seq: parse("seq", &take(&mut fields, "seq")?)?,
        retry_policy: json("retry", &take(&mut fields, "retry")?)?,
        available_at: from_millis(parse("available_at", &take(&mut fields, "available_at")?)?)?,
        lease,
        progress: optional(&mut fields, "progress")
            .map(|p| parse("progress", &p))
            .transpose()?,
        result: optional(&mut fields, "result")
            .map(|r| json("result", &r))
            .transpose()?,
        last_error: optional(&mut fields, "last_error"),
        created_at: from_millis(parse("created_at", &take(&mut fields, "created_at")?)?)?,
        updated_at: from_millis(parse("updated_at", &take(&mut fields, "updated_at")?)?)?,
        finished_at: optional(&mut fields, "finished_at")
            .map(|t| parse("finished_at", &t).and_then(from_millis))
            .transpose()?,
        history: optional(&mut fields, "history")
            .map(|h| json("history", &h))
            .transpose()?
            .unwrap_or_default(),
    })
}

/// HGETALL reply (flat field/value list) into a map.
fn pairs_to_map(flat: Vec<String>) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        map.insert(k, v);
    }
    map
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(map_redis_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(map_redis_err)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(reply.is_some())
    }

    async fn incr_bounded(
        &self,
        key: &str,
        max: u64,
        ttl: Duration,
    ) -> Result<BoundedIncr, StoreError> {
        let mut conn = self.conn.clone();
        let (count, accepted, pttl): (u64, u8, i64) = self
            .incr_bounded_script
            .key(key)
            .arg(max)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        Ok(BoundedIncr {
            count,
            accepted: accepted == 1,
            ttl_remaining: Duration::from_millis(pttl.max(0) as u64),
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(map_redis_err)?;
        Ok(removed > 0)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;

            if !keys.is_empty() {
                let removed: u64 = redis::cmd("UNLINK")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_err)?;
                deleted += removed;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(deleted)
    }
}

#[async_trait]
impl JobStore for RedisStore {
    #[instrument(
        skip(self, job),
        fields(queue = %job.queue, kind = %job.kind, job_id = %job.id),
        err
    )]
    async fn enqueue(&self, mut job: Job) -> Result<Job, JobStoreError> {
        let mut conn = self.conn.clone();
        let key = self.job_key(job.id);

        let exists: bool = conn.exists(&key).await.map_err(map_redis_err)?;
        if exists {
            return Err(JobStoreError::AlreadyExists(job.id));
        }

        job.seq = conn.incr(self.seq_key(), 1u64).await.map_err(map_redis_err)?;

        let fields = encode_job(&job)?;
        let (set, score) = if job.available_at > job.created_at {
            ("delayed", to_millis(job.available_at) as f64)
        } else {
            ("ready", job.ready_score())
        };

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .zadd(self.queue_key(&job.queue, set), job.id.to_string(), score)
            .ignore()
            .sadd(self.queues_key(), &job.queue)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.load(id).await
    }

    async fn has_ready(&self, queue: &str, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut conn = self.conn.clone();
        let (ready, due): (u64, u64) = redis::pipe()
            .zcard(self.queue_key(queue, "ready"))
            .zcount(self.queue_key(queue, "delayed"), "-inf", to_millis(now))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(ready + due > 0)
    }

    async fn lease(
        &self,
        queue: &str,
        worker_id: WorkerId,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut conn = self.conn.clone();
        let expires_at = taskmill_core::clock::add_duration(now, lease_ttl);

        let flat: Vec<String> = self
            .lease_script
            .key(self.queue_key(queue, "ready"))
            .key(self.queue_key(queue, "delayed"))
            .key(self.queue_key(queue, "active"))
            .arg(to_millis(now))
            .arg(worker_id.to_string())
            .arg(to_millis(expires_at))
            .arg(self.job_key_prefix())
            .arg(PRIORITY_MAX)
            .arg(SEQ_MULTIPLIER)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        if flat.is_empty() {
            return Ok(None);
        }
        decode_job(pairs_to_map(flat)).map(Some)
    }

    async fn renew_lease(
        &self,
        id: JobId,
        worker_id: WorkerId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut conn = self.conn.clone();
        let Some(job) = self.load(id).await? else {
            return Ok(false);
        };

        let renewed: i64 = self
            .renew_script
            .key(self.job_key(id))
            .key(self.queue_key(&job.queue, "active"))
            .arg(worker_id.to_string())
            .arg(to_millis(expires_at))
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(renewed == 1)
    }

    async fn record_progress(
        &self,
        id: JobId,
        worker_id: WorkerId,
        progress: f64,
    ) -> Result<bool, JobStoreError> {
        let mut conn = self.conn.clone();
        let recorded: i64 = self
            .progress_script
            .key(self.job_key(id))
            .arg(worker_id.to_string())
            .arg(progress.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(recorded == 1)
    }

    async fn commit(&self, job: &Job, worker_id: WorkerId) -> Result<bool, JobStoreError> {
        let mut conn = self.conn.clone();

        let finished_ms = to_millis(job.finished_at.unwrap_or(job.updated_at)) as f64;
        let (target, score) = match job.state {
            JobState::Completed => ("completed", finished_ms),
            JobState::Dead => ("dead", finished_ms),
            JobState::Pending if job.available_at > job.updated_at => {
                ("delayed", to_millis(job.available_at) as f64)
            }
            JobState::Pending => ("ready", job.ready_score()),
            JobState::Active => {
                return Err(JobStoreError::InvalidState {
                    id: job.id,
                    state: job.state,
                    expected: JobState::Pending,
                });
            }
        };

        let mut invocation = self.commit_script.prepare_invoke();
        invocation
            .key(self.job_key(job.id))
            .key(self.queue_key(&job.queue, "active"))
            .key(self.queue_key(&job.queue, "ready"))
            .key(self.queue_key(&job.queue, "delayed"))
            .key(self.queue_key(&job.queue, "completed"))
            .key(self.queue_key(&job.queue, "dead"))
            .arg(worker_id.to_string())
            .arg(job.id.to_string())
            .arg(target)
            .arg(format!("{score:.0}"));
        for (field, value) in encode_outcome(job)? {
            invocation.arg(field).arg(value);
        }

        let committed: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(committed == 1)
    }

    async fn reap_expired(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReapedJob>, JobStoreError> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .reap_script
            .key(self.queue_key(queue, "active"))
            .key(self.queue_key(queue, "ready"))
            .key(self.queue_key(queue, "dead"))
            .arg(to_millis(now))
            .arg(self.job_key_prefix())
            .arg(PRIORITY_MAX)
            .arg(SEQ_MULTIPLIER)
            .arg(REAP_REASON)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        let mut reaped = Vec::with_capacity(flat.len() / 2);
        for pair in flat.chunks(2) {
            if let [id, outcome] = pair {
                reaped.push(ReapedJob {
                    id: id
                        .parse()
                        .map_err(|e| JobStoreError::Corrupt(format!("reaped id: {e}")))?,
                    outcome: if outcome == "dead" {
                        ReapOutcome::DeadLettered
                    } else {
                        ReapOutcome::Requeued
                    },
                });
            }
        }
        Ok(reaped)
    }

    async fn remove_pending(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut conn = self.conn.clone();
        let Some(job) = self.load(id).await? else {
            return Err(JobStoreError::NotFound(id));
        };

        let removed: i64 = self
            .remove_pending_script
            .key(self.job_key(id))
            .key(self.queue_key(&job.queue, "ready"))
            .key(self.queue_key(&job.queue, "delayed"))
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        match removed {
            -1 => Err(JobStoreError::NotFound(id)),
            1 => Ok(true),
            _ => Ok(false),
        }
    }

    async fn list_dead(&self, queue: &str, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrange(self.queue_key(queue, "dead"), 0, limit as isize - 1)
            .await
            .map_err(map_redis_err)?;

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(format!("{}{}", self.job_key_prefix(), id));
        }
        let rows: Vec<HashMap<String, String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        rows.into_iter()
            .filter(|fields| !fields.is_empty())
            .map(decode_job)
            .collect()
    }

    async fn requeue_dead(
        &self,
        id: JobId,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut conn = self.conn.clone();
        let job = self.load(id).await?.ok_or(JobStoreError::NotFound(id))?;

        let requeued: i64 = self
            .requeue_dead_script
            .key(self.job_key(id))
            .key(self.queue_key(&job.queue, "dead"))
            .key(self.queue_key(&job.queue, "ready"))
            .arg(id.to_string())
            .arg(extra_attempts.max(1))
            .arg(to_millis(now))
            .arg(PRIORITY_MAX)
            .arg(SEQ_MULTIPLIER)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        match requeued {
            1 => self.load(id).await?.ok_or(JobStoreError::NotFound(id)),
            -1 => Err(JobStoreError::NotFound(id)),
            _ => Err(JobStoreError::InvalidState {
                id,
                state: job.state,
                expected: JobState::Dead,
            }),
        }
    }

    async fn purge_finished(
        &self,
        queue: &str,
        completed_before: DateTime<Utc>,
        dead_before: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = self
            .purge_script
            .key(self.queue_key(queue, "completed"))
            .key(self.queue_key(queue, "dead"))
            .arg(to_millis(completed_before))
            .arg(to_millis(dead_before))
            .arg(self.job_key_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(removed)
    }

    async fn stats(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueStats, JobStoreError> {
        let mut conn = self.conn.clone();
        let now_ms = to_millis(now);
        let (ready, due, delayed, active, completed, dead): (u64, u64, u64, u64, u64, u64) =
            redis::pipe()
                .zcard(self.queue_key(queue, "ready"))
                .zcount(self.queue_key(queue, "delayed"), "-inf", now_ms)
                .zcount(self.queue_key(queue, "delayed"), format!("({now_ms}"), "+inf")
                .zcard(self.queue_key(queue, "active"))
                .zcard(self.queue_key(queue, "completed"))
                .zcard(self.queue_key(queue, "dead"))
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;

        Ok(QueueStats {
            pending: ready + due,
            delayed,
            active,
            completed,
            dead,
        })
    }

    async fn queues(&self) -> Result<Vec<String>, JobStoreError> {
        let mut conn = self.conn.clone();
        let mut queues: Vec<String> = conn
            .smembers(self.queues_key())
            .await
            .map_err(map_redis_err)?;
        queues.sort();
        Ok(queues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("TASKMILL_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    async fn store() -> RedisStore {
        let prefix = format!("taskmill-test-{}", uuid::Uuid::now_v7());
        RedisStore::connect(redis_url(), prefix).await.unwrap()
    }

    #[test]
    fn job_fields_round_trip() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let payload = serde_json::json!({"to": ["a@b.c"], "tags": []});
        let mut job = Job::new("mail", "send", payload, now)
            .with_priority(-3)
            .with_max_attempts(4);
        job.seq = 17;
        job.mark_leased(WorkerId::new(), now, now);
        job.mark_failed("smtp down".into(), Some(Duration::from_secs(2)), now, now);

        let map: HashMap<String, String> = encode_job(&job)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let decoded = decode_job(map).unwrap();

        assert_eq!(decoded, job);
    }

    #[tokio::test]
    #[ignore = "requires a running redis (TASKMILL_TEST_REDIS_URL)"]
    async fn lease_commit_cycle_against_redis() {
        let store = store().await;
        let now = Utc::now();
        let worker = WorkerId::new();

        let stored = store
            .enqueue(Job::new("q", "k", serde_json::json!({"n": 1}), now))
            .await
            .unwrap();
        assert!(store.has_ready("q", now).await.unwrap());

        let mut leased = store
            .lease("q", worker, Duration::from_secs(30), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, stored.id);
        assert_eq!(leased.attempt, 1);
        assert!(leased.is_leased_by(worker));

        leased.mark_completed(Some(serde_json::json!("ok")), now, now);
        assert!(!store.commit(&leased, WorkerId::new()).await.unwrap());
        assert!(store.commit(&leased, worker).await.unwrap());

        let done = store.get_job(stored.id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.result, Some(serde_json::json!("ok")));
        assert_eq!(store.stats("q", now).await.unwrap().completed, 1);
        assert_eq!(store.queues().await.unwrap(), vec!["q".to_string()]);
    }

    #[tokio::test]
    #[ignore = "requires a running redis (TASKMILL_TEST_REDIS_URL)"]
    async fn delete_matching_against_redis() {
        let store = store().await;
        let ns = format!("{}:kv", store.prefix);
        crate::store::check_pattern_deletion(&store, &ns).await;
    }

    #[tokio::test]
    #[ignore = "requires a running redis (TASKMILL_TEST_REDIS_URL)"]
    async fn incr_bounded_against_redis() {
        let store = store().await;
        let key = format!("{}:counter", store.prefix);

        for _ in 0..2 {
            assert!(store.incr_bounded(&key, 2, Duration::from_secs(5)).await.unwrap().accepted);
        }
        let third = store.incr_bounded(&key, 2, Duration::from_secs(5)).await.unwrap();
        assert!(!third.accepted);
        assert_eq!(third.count, 2);
        assert!(third.ttl_remaining <= Duration::from_secs(5));
    }
}
