/*!
 * Integration tests for the usage monitor and health checker
 */

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use hearth::{
    engine::{Engine, UsageProbe},
    monitor::{HealthChecker, HealthCheckerConfig, HealthSource, MonitorConfig, UsageMonitor},
    recovery::{RecoveryConfig, RecoveryManager},
    service::Service,
    sim::{FailureInjector, SimBackend, SimRequest, SimUsageProbe},
    CallContext, ExponentialBackoff, HealthPolicy, PoolConfig,
};

const GIB: u64 = 1 << 30;

async fn sim_service(injector: &Arc<FailureInjector>, capacity: usize) -> Arc<Service<SimBackend>> {
    let backend = SimBackend::new(Arc::clone(injector), Duration::ZERO);
    let probe: Arc<dyn UsageProbe> =
        Arc::new(SimUsageProbe::new(8 * GIB, 2 * GIB, GIB, backend.live_contexts()));
    Arc::new(
        Service::new(backend, PoolConfig::eager(capacity))
            .await
            .unwrap()
            .with_usage_probe(probe),
    )
}

fn counter() -> (Arc<AtomicU32>, Arc<AtomicU32>) {
    let count = Arc::new(AtomicU32::new(0));
    (Arc::clone(&count), count)
}

#[tokio::test]
async fn test_unhealthy_callback_fires_once_per_transition() {
    let injector = FailureInjector::with_rate(0.0);
    let service = sim_service(&injector, 1).await;

    let (unhealthy, unhealthy_seen) = counter();
    let (healthy, healthy_seen) = counter();
    let checker = HealthChecker::builder(Arc::clone(&service) as Arc<dyn HealthSource>)
        .on_unhealthy(move |_reason| {
            unhealthy_seen.fetch_add(1, Ordering::SeqCst);
        })
        .on_healthy(move || {
            healthy_seen.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    // Healthy baseline; the first check never fires a callback
    assert!(checker.check_now().await.healthy);
    assert!(checker.is_healthy());

    injector.force_failures(true);
    let ctx = CallContext::background();
    let request = SimRequest::new("warm up", 2);
    for _ in 0..10 {
        assert!(service.infer(&ctx, &request).await.is_err());
    }

    for _ in 0..5 {
        let snapshot = checker.check_now().await;
        assert!(!snapshot.healthy);
        assert!(snapshot.status.contains("error rate"));
    }

    assert_eq!(unhealthy.load(Ordering::SeqCst), 1);
    assert_eq!(healthy.load(Ordering::SeqCst), 0);
    assert!(!checker.is_healthy());

    let stats = checker.stats();
    assert_eq!(stats.checks, 6);
    assert_eq!(stats.failures, 5);
}

#[tokio::test]
async fn test_policy_flags_low_memory() {
    let injector = FailureInjector::with_rate(0.0);
    // Two GiB base plus one GiB per context leaves two GiB free
    let service = sim_service(&injector, 4).await;

    let checker = HealthChecker::new(
        service as Arc<dyn HealthSource>,
        HealthCheckerConfig {
            policy: HealthPolicy {
                min_free_bytes: 3 * GIB,
                ..Default::default()
            },
            ..Default::default()
        },
    );

    let snapshot = checker.check_now().await;
    assert!(!snapshot.healthy);
    assert!(snapshot.status.contains("insufficient memory"));
    assert_eq!(snapshot.usage.unwrap().free_bytes, 2 * GIB);
}

#[tokio::test(start_paused = true)]
async fn test_checker_reports_degraded_manager() {
    let injector = FailureInjector::with_rate(0.0);
    let service = sim_service(&injector, 1).await;
    let manager = Arc::new(RecoveryManager::new(
        service,
        RecoveryConfig {
            max_retries: 3,
            backoff: ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(1), 1.0),
            ..Default::default()
        },
    ));

    // Judge only the manager's own verdict, not the request error rate
    let checker = HealthChecker::new(
        Arc::clone(&manager) as Arc<dyn HealthSource>,
        HealthCheckerConfig {
            policy: HealthPolicy {
                max_error_rate: 1.0,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    assert!(checker.check_now().await.healthy);

    // Without a loader every reload fails, so degraded mode arrives quickly
    injector.force_failures(true);
    let ctx = CallContext::background();
    while manager.is_healthy() {
        let _ = manager.execute(&ctx, &SimRequest::new("x", 1)).await;
    }

    let snapshot = checker.check_now().await;
    assert!(!snapshot.healthy);
    assert!(snapshot.status.starts_with("degraded"));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_monitors_stop_with_root_token() {
    let injector = FailureInjector::with_rate(0.0);
    let service = sim_service(&injector, 2).await;

    let live = service.backend().live_contexts();
    let usage = UsageMonitor::new(
        Arc::new(SimUsageProbe::new(8 * GIB, 2 * GIB, GIB, live)),
        MonitorConfig {
            interval: Duration::from_secs(1),
            alert_threshold_pct: 50.0,
            ..Default::default()
        },
    );
    let health = HealthChecker::new(
        Arc::clone(&service) as Arc<dyn HealthSource>,
        HealthCheckerConfig {
            interval: Duration::from_secs(1),
            ..Default::default()
        },
    );

    let root = CancellationToken::new();
    assert!(usage.start(&root));
    assert!(health.start(&root));
    assert!(!usage.start(&root));

    tokio::time::sleep(Duration::from_millis(3500)).await;
    root.cancel();
    usage.stop().await;
    health.stop().await;

    let usage_stats = usage.stats();
    assert!(!usage_stats.running);
    assert_eq!(usage_stats.checks, 4);
    // 4 GiB of 8 used is exactly the threshold
    assert_eq!(usage_stats.alerts, 4);
    assert_eq!(usage_stats.last_sample.unwrap().used_bytes, 4 * GIB);

    let health_stats = health.stats();
    assert!(!health_stats.running);
    assert_eq!(health_stats.checks, 4);
    assert_eq!(health_stats.failures, 0);
    assert!(health_stats.healthy);

    service.close().await;
}
