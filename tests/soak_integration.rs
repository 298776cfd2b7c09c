/*!
 * Randomized concurrent soak through the full stack
 *
 * Many callers share one RecoveryManager while the backend fails at random.
 * Schedules differ between runs, so only invariants that hold for every
 * interleaving are asserted.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use hearth::{
    engine::{Engine, Loader},
    recovery::{RecoveryConfig, RecoveryManager},
    service::Service,
    sim::{FailureInjector, SimBackend, SimLoader, SimRequest},
    CallContext, ExponentialBackoff, PoolConfig,
};

const WORKERS: u64 = 8;
const REQUESTS_PER_WORKER: u64 = 25;
const CAPACITY: usize = 3;

#[derive(Default)]
struct Tally {
    succeeded: AtomicU64,
    shed: AtomicU64,
    failed: AtomicU64,
}

#[tokio::test(start_paused = true)]
async fn test_random_failures_under_concurrency() {
    let injector = FailureInjector::with_rate(0.2);
    let backend = SimBackend::new(Arc::clone(&injector), Duration::from_millis(3));
    let live = backend.live_contexts();
    let loader = Arc::new(SimLoader::new(
        PoolConfig::lazy(CAPACITY),
        Arc::clone(&injector),
        &backend,
    ));
    let service = Service::new(backend, PoolConfig::lazy(CAPACITY)).await.unwrap();

    let manager = Arc::new(
        RecoveryManager::builder(Arc::new(service))
            .config(RecoveryConfig {
                max_retries: 5,
                backoff: ExponentialBackoff::new(
                    Duration::from_millis(2),
                    Duration::from_millis(20),
                    2.0,
                ),
                recovery_interval: Duration::from_millis(500),
                ..Default::default()
            })
            .loader(Arc::clone(&loader) as Arc<dyn Loader<Service<SimBackend>>>)
            .canary(SimRequest::new("ping", 1))
            .build(),
    );

    let tally = Arc::new(Tally::default());
    let mut workers = Vec::new();
    for worker in 0..WORKERS {
        let manager = Arc::clone(&manager);
        let tally = Arc::clone(&tally);
        workers.push(tokio::spawn(async move {
            for n in 0..REQUESTS_PER_WORKER {
                let (stagger, tokens) = {
                    let mut rng = rand::rng();
                    (rng.random_range(0..5u64), rng.random_range(1..32usize))
                };
                tokio::time::sleep(Duration::from_millis(stagger)).await;

                let ctx = CallContext::background().with_timeout(Duration::from_secs(5));
                let request = SimRequest::new(format!("worker {} request {}", worker, n), tokens);
                match manager.execute(&ctx, &request).await {
                    Ok(out) => {
                        assert_eq!(out.tokens, tokens);
                        tally.succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.is_degraded() => {
                        tally.shed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        tally.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let stats = manager.stats();
    let succeeded = tally.succeeded.load(Ordering::Relaxed);
    let shed = tally.shed.load(Ordering::Relaxed);
    let failed = tally.failed.load(Ordering::Relaxed);

    assert_eq!(stats.total_requests, WORKERS * REQUESTS_PER_WORKER);
    assert_eq!(succeeded + shed + failed, stats.total_requests);
    assert_eq!(stats.successful_requests, succeeded);
    assert!(succeeded > 0);
    assert!(stats.retry_attempts >= failed);
    assert_eq!(stats.model_reloads, u64::from(loader.loads()) - stats.model_reload_failures);

    // Every context is back in its pool and no pool grew past capacity
    let engine = manager.engine();
    let pool = engine.pool_stats();
    assert_eq!(pool.in_use, 0);
    assert!(pool.created <= CAPACITY);
    assert_eq!(pool.total_acquires, pool.total_releases);

    manager.shutdown().await;
    engine.close().await;

    // Replaced engines close on spawned tasks; give them a chance to finish
    for _ in 0..10 {
        if live.load(Ordering::SeqCst) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(live.load(Ordering::SeqCst), 0);
}
