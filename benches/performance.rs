//! Performance benchmarks for the subscription cache.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use docket_cache::{CacheConfig, ManualScheduler, MemoryBackend, Query, SubscriptionCache};
use serde_json::json;
use std::sync::Arc;

fn create_cache(backend: &Arc<MemoryBackend>) -> SubscriptionCache {
    SubscriptionCache::with_scheduler(
        backend.clone(),
        CacheConfig::default(),
        Arc::new(ManualScheduler::new()),
    )
}

/// Benchmark attaching to a warm entry (stale replay path)
fn bench_attach_warm(c: &mut Criterion) {
    let backend = Arc::new(MemoryBackend::new());
    for i in 0..100 {
        backend
            .set(&format!("clients/{}", i), json!({"name": format!("client {}", i)}))
            .unwrap();
    }
    let cache = create_cache(&backend);
    let query = Query::collection("clients").unwrap();
    let _keepalive = cache.observe_collection(Some(&query));

    c.bench_function("attach_detach_warm", |b| {
        b.iter(|| {
            let observation = cache.observe_collection(Some(black_box(&query)));
            black_box(observation.data());
        });
    });
}

/// Benchmark fan-out of one emission to many observers
fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for observers in [1, 10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("observers", observers),
            &observers,
            |b, &count| {
                let backend = Arc::new(MemoryBackend::new());
                let cache = create_cache(&backend);
                let query = Query::collection("hearings").unwrap();
                let handles: Vec<_> = (0..count)
                    .map(|_| cache.observe_collection(Some(&query)))
                    .collect();

                let mut n = 0u64;
                b.iter(|| {
                    n += 1;
                    backend
                        .set("hearings/h1", json!({"revision": n}))
                        .unwrap();
                });

                black_box(handles);
            },
        );
    }

    group.finish();
}

/// Benchmark key derivation for filtered queries
fn bench_key_derivation(c: &mut Criterion) {
    let query = Query::collection("processes")
        .unwrap()
        .where_field("status", docket_cache::FilterOp::Eq, "open")
        .where_field("court", docket_cache::FilterOp::Eq, "TJSP")
        .order_by("filedAt", docket_cache::Direction::Desc)
        .limit(50);

    c.bench_function("cache_key", |b| {
        b.iter(|| black_box(query.cache_key()));
    });
}

criterion_group!(benches, bench_attach_warm, bench_fan_out, bench_key_derivation);
criterion_main!(benches);
