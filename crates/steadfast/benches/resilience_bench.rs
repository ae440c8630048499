//! Resilience benchmarks
//!
//! Benchmarks for circuit breaker call paths, bulkhead admission, and
//! backoff calculation.
//!
//! Run with: `cargo bench --bench resilience_bench -p steadfast`

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use steadfast::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, ResilienceError, RetryPolicy,
};
use tokio::runtime::Builder as RuntimeBuilder;

#[derive(Debug, thiserror::Error)]
#[error("benchmark failure")]
struct BenchError;

fn bench_circuit_breaker_paths(c: &mut Criterion) {
    let runtime = RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .expect("benchmark runtime");

    let mut group = c.benchmark_group("circuit_breaker");

    group.bench_function("protect_success", |b| {
        let breaker = CircuitBreaker::with_defaults();
        b.iter(|| {
            let result: Result<_, ResilienceError<BenchError>> =
                runtime.block_on(breaker.protect(|| async { Ok(()) }));
            let _result = black_box(result);
        });
    });

    group.bench_function("protect_rejected_when_open", |b| {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .open_duration(Duration::from_secs(3600))
            .build()
            .expect("valid breaker config for benchmarks");
        let breaker = CircuitBreaker::new(config).expect("breaker should build");
        let _: Result<(), _> =
            runtime.block_on(breaker.protect(|| async { Err::<(), _>(BenchError) }));

        b.iter(|| {
            let result: Result<(), ResilienceError<BenchError>> =
                runtime.block_on(breaker.protect(|| async { Ok(()) }));
            let _result = black_box(result);
        });
    });

    group.finish();
}

fn bench_bulkhead_admission(c: &mut Criterion) {
    let runtime = RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .expect("benchmark runtime");

    let mut group = c.benchmark_group("bulkhead");

    group.bench_function("protect_uncontended", |b| {
        let config = BulkheadConfig::builder()
            .max_concurrent(64)
            .build()
            .expect("valid bulkhead config for benchmarks");
        let bulkhead = Bulkhead::new(config).expect("bulkhead should build");
        b.iter(|| {
            let result: Result<_, ResilienceError<BenchError>> =
                runtime.block_on(bulkhead.protect(|| async { Ok(()) }));
            let _result = black_box(result);
        });
    });

    group.finish();
}

fn bench_backoff_calculation(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");

    let policies = [
        ("fixed", RetryPolicy::fixed(10, Duration::from_millis(100)).expect("valid policy")),
        ("linear", RetryPolicy::linear(10, Duration::from_millis(100)).expect("valid policy")),
        (
            "exponential",
            RetryPolicy::exponential(10, Duration::from_millis(100)).expect("valid policy"),
        ),
        (
            "exponential_jitter",
            RetryPolicy::exponential_with_jitter(10, Duration::from_millis(100))
                .expect("valid policy"),
        ),
    ];

    for (name, policy) in policies {
        group.bench_with_input(BenchmarkId::new("delay_for_attempt", name), &policy, |b, policy| {
            b.iter(|| {
                for attempt in 1..=9u32 {
                    black_box(policy.delay_for_attempt(black_box(attempt)));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_circuit_breaker_paths,
    bench_bulkhead_admission,
    bench_backoff_calculation
);
criterion_main!(benches);
