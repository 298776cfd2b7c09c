/*!
 * Periodic health checker
 *
 * Probes a [`HealthSource`], applies a [`HealthPolicy`] on top of the
 * source's own verdict, and reports transitions between healthy and
 * unhealthy. The first check establishes a baseline and never fires a
 * transition callback.
 */

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hearth_core_resilience::{HealthPolicy, HealthSnapshot, ResilienceError};

use super::{MonitorLoop, PeriodicCheck};
use crate::engine::{Backend, Engine};
use crate::recovery::RecoveryManager;
use crate::service::Service;

/// Anything that can report a [`HealthSnapshot`]
#[async_trait]
pub trait HealthSource: Send + Sync + 'static {
    async fn health_snapshot(&self) -> HealthSnapshot;
}

#[async_trait]
impl<B: Backend> HealthSource for Service<B> {
    async fn health_snapshot(&self) -> HealthSnapshot {
        self.health_probe().await
    }
}

/// Probes whichever engine is current, and reports unhealthy while degraded
#[async_trait]
impl<E: Engine> HealthSource for RecoveryManager<E> {
    async fn health_snapshot(&self) -> HealthSnapshot {
        let mut snapshot = self.engine().health_probe().await;
        let stats = self.stats();
        if stats.in_degraded_mode {
            snapshot.healthy = false;
            snapshot.status = format!(
                "degraded: {}",
                stats.degraded_reason.as_deref().unwrap_or("recovery exhausted")
            );
        }
        snapshot
    }
}

pub type HealthyCallback = Arc<dyn Fn() + Send + Sync>;
pub type UnhealthyCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type CheckCallback = Arc<dyn Fn(&HealthSnapshot) + Send + Sync>;

/// Configuration for [`HealthChecker`]
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// Time between checks
    pub interval: Duration,
    /// Upper bound on one probe; a probe that runs longer counts as unhealthy
    pub timeout: Duration,
    pub policy: HealthPolicy,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            policy: HealthPolicy::default(),
        }
    }
}

impl HealthCheckerConfig {
    /// Replace zero values with defaults. A zero `min_free_bytes` is kept
    /// and turns the memory floor off.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.interval.is_zero() {
            self.interval = defaults.interval;
        }
        if self.timeout.is_zero() {
            self.timeout = defaults.timeout;
        }
        if self.policy.max_error_rate <= 0.0 {
            self.policy.max_error_rate = defaults.policy.max_error_rate;
        }
        if self.policy.min_samples == 0 {
            self.policy.min_samples = defaults.policy.min_samples;
        }
        self
    }
}

/// Health checker statistics
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckerStats {
    pub running: bool,
    pub healthy: bool,
    pub checks: u64,
    /// Checks that ended unhealthy
    pub failures: u64,
    pub last_snapshot: Option<HealthSnapshot>,
    pub uptime: Duration,
}

const UNKNOWN: u8 = 0;
const HEALTHY: u8 = 1;
const UNHEALTHY: u8 = 2;

#[derive(Default)]
struct Callbacks {
    on_healthy: Option<HealthyCallback>,
    on_unhealthy: Option<UnhealthyCallback>,
    on_check: Option<CheckCallback>,
}

struct CheckerInner {
    source: Arc<dyn HealthSource>,
    config: HealthCheckerConfig,
    callbacks: Callbacks,
    health: AtomicU8,
    last: RwLock<Option<HealthSnapshot>>,
    checks: AtomicU64,
    failures: AtomicU64,
}

impl CheckerInner {
    async fn perform_check(&self) -> HealthSnapshot {
        self.checks.fetch_add(1, Ordering::Relaxed);

        let mut snapshot =
            match tokio::time::timeout(self.config.timeout, self.source.health_snapshot()).await {
                Ok(snapshot) => snapshot,
                Err(_) => HealthSnapshot::unhealthy(format!(
                    "health check failed: {}",
                    ResilienceError::Timeout(self.config.timeout)
                )),
            };

        let verdict = self.config.policy.evaluate(&snapshot);
        snapshot.healthy = verdict.healthy;
        if !verdict.healthy {
            snapshot.status = verdict.reason();
            self.failures.fetch_add(1, Ordering::Relaxed);
        }

        *self.last.write() = Some(snapshot.clone());
        self.update_health(snapshot.healthy, &snapshot.status);

        if let Some(callback) = &self.callbacks.on_check {
            callback(&snapshot);
        }

        snapshot
    }

    fn update_health(&self, healthy: bool, reason: &str) {
        let next = if healthy { HEALTHY } else { UNHEALTHY };
        let previous = self.health.swap(next, Ordering::AcqRel);

        if previous == next {
            return;
        }
        if previous == UNKNOWN {
            debug!(healthy, "Initial health established");
            return;
        }

        if healthy {
            info!("✅ Engine healthy again");
            if let Some(callback) = &self.callbacks.on_healthy {
                callback();
            }
        } else {
            warn!(reason, "❌ Engine unhealthy");
            if let Some(callback) = &self.callbacks.on_unhealthy {
                callback(reason);
            }
        }
    }
}

#[async_trait]
impl PeriodicCheck for CheckerInner {
    async fn run_check(&self) {
        self.perform_check().await;
    }
}

/// Periodically verifies that an engine is healthy
pub struct HealthChecker {
    inner: Arc<CheckerInner>,
    runner: MonitorLoop,
}

impl HealthChecker {
    pub fn new(source: Arc<dyn HealthSource>, config: HealthCheckerConfig) -> Self {
        Self::with_callbacks(source, config, Callbacks::default())
    }

    fn with_callbacks(
        source: Arc<dyn HealthSource>,
        config: HealthCheckerConfig,
        callbacks: Callbacks,
    ) -> Self {
        let config = config.normalized();
        let runner = MonitorLoop::new("health", config.interval);
        Self {
            inner: Arc::new(CheckerInner {
                source,
                config,
                callbacks,
                health: AtomicU8::new(UNKNOWN),
                last: RwLock::new(None),
                checks: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
            runner,
        }
    }

    pub fn builder(source: Arc<dyn HealthSource>) -> HealthCheckerBuilder {
        HealthCheckerBuilder {
            source,
            config: HealthCheckerConfig::default(),
            callbacks: Callbacks::default(),
        }
    }

    /// Start checking in the background. No-op if already running.
    pub fn start(&self, parent: &CancellationToken) -> bool {
        let started = self.runner.start(parent, Arc::clone(&self.inner));
        if started {
            info!(interval = ?self.inner.config.interval, "Health checker started");
        }
        started
    }

    pub async fn stop(&self) {
        self.runner.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    /// True only after a check has found the engine healthy
    pub fn is_healthy(&self) -> bool {
        self.inner.health.load(Ordering::Acquire) == HEALTHY
    }

    /// Run a check now, outside the periodic schedule
    pub async fn check_now(&self) -> HealthSnapshot {
        self.inner.perform_check().await
    }

    pub fn last_snapshot(&self) -> Option<HealthSnapshot> {
        self.inner.last.read().clone()
    }

    pub fn stats(&self) -> HealthCheckerStats {
        HealthCheckerStats {
            running: self.is_running(),
            healthy: self.is_healthy(),
            checks: self.inner.checks.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
            last_snapshot: self.last_snapshot(),
            uptime: self.runner.uptime(),
        }
    }
}

/// Builder for [`HealthChecker`]
pub struct HealthCheckerBuilder {
    source: Arc<dyn HealthSource>,
    config: HealthCheckerConfig,
    callbacks: Callbacks,
}

impl HealthCheckerBuilder {
    pub fn config(mut self, config: HealthCheckerConfig) -> Self {
        self.config = config;
        self
    }

    /// Called when a check finds the engine healthy after an unhealthy check
    pub fn on_healthy<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_healthy = Some(Arc::new(callback));
        self
    }

    /// Called with the reason when a check finds the engine unhealthy after
    /// a healthy check
    pub fn on_unhealthy<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_unhealthy = Some(Arc::new(callback));
        self
    }

    /// Called after every check
    pub fn on_check<F>(mut self, callback: F) -> Self
    where
        F: Fn(&HealthSnapshot) + Send + Sync + 'static,
    {
        self.callbacks.on_check = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> HealthChecker {
        HealthChecker::with_callbacks(self.source, self.config, self.callbacks)
    }
}
