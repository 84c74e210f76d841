use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskmill_core::{SystemClock, WorkerId};
use taskmill_infra::cache::Cache;
use taskmill_infra::jobs::{Job, JobStore};
use taskmill_infra::rate_limit::RateLimiter;
use taskmill_infra::store::InMemoryStore;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_enqueue_lease_commit(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("queue");

    for batch in [100usize, 1_000] {
        group.throughput(Throughput::Elements(batch as u64));
        let id = BenchmarkId::new("enqueue_lease_commit", batch);
        group.bench_with_input(id, &batch, |b, &batch| {
            b.iter(|| {
                rt.block_on(async {
                    let store = InMemoryStore::new();
                    let worker = WorkerId::new();
                    let now = Utc::now();

                    for n in 0..batch {
                        store
                            .enqueue(Job::new("bench", "noop", serde_json::json!({ "n": n }), now))
                            .await
                            .unwrap();
                    }
                    while let Some(mut job) = store
                        .lease("bench", worker, Duration::from_secs(30), now)
                        .await
                        .unwrap()
                    {
                        job.mark_completed(None, now, now);
                        black_box(store.commit(&job, worker).await.unwrap());
                    }
                })
            });
        });
    }
    group.finish();
}

fn bench_priority_lease(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("lease_with_mixed_priorities_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryStore::new();
                let now = Utc::now();
                for n in 0..1_000i16 {
                    let job = Job::new("bench", "noop", serde_json::Value::Null, now);
                    store.enqueue(job.with_priority(n % 7)).await.unwrap();
                }
                black_box(
                    store
                        .lease("bench", WorkerId::new(), Duration::from_secs(30), now)
                        .await
                        .unwrap(),
                );
            })
        });
    });
}

fn bench_cache_and_rate_limit(c: &mut Criterion) {
    let rt = runtime();
    let store = Arc::new(InMemoryStore::new());
    let cache = Cache::new(store.clone(), "bench");
    let limiter = RateLimiter::new(store, SystemClock::shared(), "bench");

    let key = "organizations:detail:1";
    let value = serde_json::json!({"name": "Acme"});
    rt.block_on(cache.set(key, &value, Duration::from_secs(600)));

    c.bench_function("cache_hit", |b| {
        b.iter(|| rt.block_on(async { black_box(cache.get::<serde_json::Value>(key).await) }))
    });
    c.bench_function("rate_limit_allow", |b| {
        let window = Duration::from_secs(60);
        b.iter(|| rt.block_on(async { black_box(limiter.allow("client", u64::MAX, window).await) }))
    });
}

criterion_group!(
    benches,
    bench_enqueue_lease_commit,
    bench_priority_lease,
    bench_cache_and_rate_limit
);
criterion_main!(benches);
