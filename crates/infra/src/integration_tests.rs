//! Integration tests across the store, engine, scheduler and rate limiter.
//!
//! Tests: producer → JobStore → worker pool → handler → commit
//!
//! Verifies:
//! - Failing handlers are retried with growing backoff until they succeed
//! - Expired leases are redelivered exactly once per stall
//! - The reaper covers queues it only knows from the store
//! - Shutdown returns in-flight jobs to pending
//! - Two scheduler processes fire a due occurrence exactly once

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use taskmill_core::{Clock, ManualClock, SharedClock, SystemClock, WorkerId};

    use crate::config::EngineConfig;
    use crate::jobs::{
        Engine, EnqueueOptions, HandlerError, HandlerOptions, Job, JobContext, JobOutput, JobState,
        JobStore, ReapOutcome, RetryPolicy,
    };
    use crate::rate_limit::RateLimiter;
    use crate::scheduler::{Cadence, ScheduledJobDefinition, Scheduler};
    use crate::store::{InMemoryStore, StoreHandle};

    fn config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(5),
            reaper_interval: Duration::from_secs(3600),
            lease_ttl: Duration::from_secs(2),
            ..EngineConfig::default()
        }
    }

    fn engine(store: &Arc<InMemoryStore>, clock: SharedClock, config: EngineConfig) -> Engine {
        let limiter = Arc::new(RateLimiter::new(store.clone(), clock.clone(), "it"));
        Engine::with_clock(StoreHandle::new(store.clone()), config, limiter, clock)
    }

    async fn wait_until<F>(store: &InMemoryStore, id: taskmill_core::JobId, done: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        for _ in 0..500 {
            if let Some(job) = store.get_job(id).await.unwrap() {
                if done(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not reach the expected state");
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds_on_third_attempt() {
        let store = InMemoryStore::arc();
        let engine = engine(&store, SystemClock::shared(), config());
        let calls = Arc::new(AtomicU32::new(0));

        let seen = calls.clone();
        engine
            .register_handler(
                "notifications",
                "dispatch",
                move |ctx: JobContext| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        if ctx.attempt < 3 {
                            let reason = format!("smtp refused (attempt {})", ctx.attempt);
                            Err(HandlerError::failed(reason))
                        } else {
                            Ok(JobOutput::value(serde_json::json!({"delivered": true})))
                        }
                    }
                },
                HandlerOptions::default(),
            )
            .unwrap();
        engine.initialize().await.unwrap();

        let backoff = RetryPolicy::exponential(Duration::from_millis(20), Duration::from_secs(1));
        let id = engine
            .enqueue(
                "notifications",
                "dispatch",
                serde_json::json!({"user": 42}),
                EnqueueOptions::default().with_max_attempts(3).with_backoff(backoff),
            )
            .await
            .unwrap();

        let job = wait_until(&store, id, |j| j.state.is_terminal()).await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempt, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let delays = job.backoff_delays();
        assert_eq!(delays.len(), 2);
        assert!(delays[1] >= delays[0]);
        assert!(delays[0] >= Duration::from_millis(20));
        assert_eq!(job.last_error.as_deref(), Some("smtp refused (attempt 2)"));

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_once() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryStore::with_clock(clock.shared()));
        let engine = engine(&store, clock.shared(), config());

        let id = engine
            .enqueue("index", "sync", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        // A worker in another process leases the job and dies.
        let crashed = WorkerId::new();
        store
            .lease("index", crashed, Duration::from_secs(2), clock.now())
            .await
            .unwrap()
            .unwrap();

        clock.advance(Duration::from_secs(3));
        let reaped = engine.run_maintenance().await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].outcome, ReapOutcome::Requeued);
        // Same stall, next cycle: nothing left to reap.
        assert!(engine.run_maintenance().await.unwrap().is_empty());

        engine
            .register_handler(
                "index",
                "sync",
                |_ctx: JobContext| async { Ok::<_, HandlerError>(JobOutput::empty()) },
                HandlerOptions::default(),
            )
            .unwrap();
        engine.initialize().await.unwrap();

        let job = wait_until(&store, id, |j| j.state == JobState::Completed).await;
        assert_eq!(job.attempt, 2);

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn reaper_covers_queues_only_another_process_used() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryStore::with_clock(clock.shared()));
        let producer = engine(&store, clock.shared(), config());
        let reaper = engine(&store, clock.shared(), config());

        let id = producer
            .enqueue("exports", "csv", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        store
            .lease("exports", WorkerId::new(), Duration::from_secs(1), clock.now())
            .await
            .unwrap()
            .unwrap();
        assert!(reaper.queues().is_empty());
        assert_eq!(reaper.all_queues().await.unwrap(), vec!["exports"]);

        clock.advance(Duration::from_secs(2));
        let reaped = reaper.run_maintenance().await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, id);
        assert_eq!(store.get_job(id).await.unwrap().unwrap().state, JobState::Pending);
    }

    #[tokio::test]
    async fn stall_on_last_attempt_goes_dead() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryStore::with_clock(clock.shared()));
        let engine = engine(&store, clock.shared(), config());

        let id = engine
            .enqueue(
                "files",
                "transfer",
                serde_json::json!({}),
                EnqueueOptions::default().with_max_attempts(1),
            )
            .await
            .unwrap();
        store
            .lease("files", WorkerId::new(), Duration::from_secs(1), clock.now())
            .await
            .unwrap()
            .unwrap();

        clock.advance(Duration::from_secs(2));
        let reaped = engine.run_maintenance().await.unwrap();
        assert_eq!(reaped[0].outcome, ReapOutcome::DeadLettered);

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempt, job.max_attempts);
        assert_eq!(job.last_error.as_deref(), Some("lease expired"));
    }

    #[tokio::test]
    async fn shutdown_returns_running_jobs_to_pending() {
        let store = InMemoryStore::arc();
        let engine = engine(&store, SystemClock::shared(), config());
        engine
            .register_handler(
                "cleanup",
                "purge",
                |_ctx: JobContext| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, HandlerError>(JobOutput::empty())
                },
                HandlerOptions::default(),
            )
            .unwrap();
        engine.initialize().await.unwrap();

        let id = engine
            .enqueue("cleanup", "purge", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        wait_until(&store, id, |j| j.state == JobState::Active).await;

        let report = engine.shutdown(Duration::from_millis(50)).await;
        assert!(!report.drained);
        assert_eq!(report.released, 1);

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt, 1);
        assert!(job.lease.is_none());
        assert!(engine.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn two_engines_share_one_queue_without_double_delivery() {
        let store = InMemoryStore::arc();
        let runs = Arc::new(AtomicU32::new(0));
        let mut engines = Vec::new();

        for _ in 0..2 {
            let engine = engine(&store, SystemClock::shared(), config());
            let runs = runs.clone();
            engine
                .register_handler(
                    "search",
                    "reindex",
                    move |_ctx: JobContext| {
                        let runs = runs.clone();
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, HandlerError>(JobOutput::empty())
                        }
                    },
                    HandlerOptions::default().with_concurrency(3),
                )
                .unwrap();
            engine.initialize().await.unwrap();
            engines.push(engine);
        }

        let mut ids = Vec::new();
        for n in 0..40 {
            let payload = serde_json::json!({"doc": n});
            let id = engines[n % 2]
                .enqueue("search", "reindex", payload, EnqueueOptions::default())
                .await
                .unwrap();
            ids.push(id);
        }
        for id in ids {
            let job = wait_until(&store, id, |j| j.state == JobState::Completed).await;
            assert_eq!(job.attempt, 1);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 40);

        for engine in engines {
            engine.shutdown(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test]
    async fn two_schedulers_fire_a_due_occurrence_once() {
        let start: DateTime<Utc> = "2024-05-01T11:59:30Z".parse().unwrap();
        let clock = ManualClock::new(start);
        let store = Arc::new(InMemoryStore::with_clock(clock.shared()));

        let mut schedulers = Vec::new();
        for _ in 0..2 {
            let engine = engine(&store, clock.shared(), config());
            let scheduler = Scheduler::new(engine, "it", Duration::from_secs(3600));
            scheduler
                .register_recurring(ScheduledJobDefinition::new(
                    "retention-cleanup",
                    Cadence::cron("0 12 * * *").unwrap(),
                    "maintenance",
                    "purge-expired",
                    serde_json::json!({"older_than_days": 30}),
                ))
                .unwrap();
            schedulers.push(scheduler);
        }

        clock.set("2024-05-01T12:00:10Z".parse().unwrap());
        let (a, b) = tokio::join!(schedulers[0].tick(), schedulers[1].tick());

        assert_eq!(a.fired.len() + b.fired.len(), 1);
        assert_eq!(a.skipped_locked + b.skipped_locked + a.not_due + b.not_due, 1);
        assert_eq!(store.stats("maintenance", clock.now()).await.unwrap().pending, 1);

        // Later ticks of either process do not fire the same occurrence again.
        clock.advance(Duration::from_secs(30));
        for scheduler in &schedulers {
            assert!(scheduler.tick().await.fired.is_empty());
        }
        assert_eq!(store.stats("maintenance", clock.now()).await.unwrap().pending, 1);
    }
}
