//! Concurrency tests for health tracking and per-provider limits

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, ok};
use orchestration::router::circuit_breaker::BreakerSettings;
use orchestration::{
    Admission, BackendRequest, BreakerConfig, HealthMonitor, ProviderAdapter, ProviderRegistry,
    RetryPolicy, ScriptedBackend,
};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Test: hammering one provider's counters from many threads loses no updates
#[test]
fn test_concurrent_records_lose_no_updates() {
    let settings = BreakerSettings {
        failure_threshold: u32::MAX,
        cooldown: Duration::from_secs(60),
        window: Duration::from_secs(300),
    };
    let monitor = Arc::new(HealthMonitor::with_settings([
        ("hot".to_string(), settings),
        ("cold".to_string(), settings),
    ]));

    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 2_000;
    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let monitor = monitor.clone();
            scope.spawn(move || {
                for i in 0..PER_THREAD {
                    if (i + t) % 2 == 0 {
                        monitor.record_success("hot");
                    } else {
                        monitor.record_failure("hot");
                    }
                    monitor.is_available("hot");
                    monitor.try_acquire("hot");
                }
            });
        }
    });

    let snap = monitor.snapshot_of("hot").unwrap();
    assert_eq!(snap.total_successes + snap.total_failures, THREADS * PER_THREAD);
    assert_eq!(snap.total_successes, THREADS * PER_THREAD / 2);
    let cold = monitor.snapshot_of("cold").unwrap();
    assert_eq!(cold.total_successes + cold.total_failures, 0);
}

/// Test: the per-provider semaphore caps in-flight calls
#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_queues_excess_calls() {
    let mut cfg = config(&["capped"]);
    cfg.providers[0].max_concurrent = Some(2);
    let registry = ProviderRegistry::from_config(&cfg).unwrap();
    let health = Arc::new(HealthMonitor::new(&registry, &BreakerConfig::default()));
    let backend = Arc::new(
        ScriptedBackend::new(vec![ok("done")]).with_delay(Duration::from_millis(100)),
    );
    let adapter = Arc::new(ProviderAdapter::new(
        registry.get("capped").unwrap().clone(),
        backend.clone(),
        health.clone(),
        RetryPolicy::none(),
    ));
    let request = Arc::new(BackendRequest {
        system_prompt: "sys".into(),
        history: Vec::new(),
        message: "hi".into(),
    });

    let started = Instant::now();
    let mut calls = JoinSet::new();
    for _ in 0..10 {
        let adapter = adapter.clone();
        let request = request.clone();
        calls.spawn(async move { adapter.invoke(&request, Admission::Guarded, None).await });
    }
    tokio::task::yield_now().await;
    assert!(adapter.in_flight() <= 2);

    let mut succeeded = 0;
    while let Some(joined) = calls.join_next().await {
        if joined.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(backend.calls(), 10);
    // Ten 100ms calls, two at a time.
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(health.snapshot_of("capped").unwrap().total_successes, 10);
}
