/*!
 * Accelerator memory monitor
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hearth_core_resilience::{ResilienceError, UsageSnapshot};

use super::{MonitorLoop, PeriodicCheck};
use crate::engine::UsageProbe;

pub type UsageCallback = Arc<dyn Fn(&UsageSnapshot) + Send + Sync>;

const GIB: f64 = (1u64 << 30) as f64;

/// Configuration for [`UsageMonitor`]
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between samples
    pub interval: Duration,
    /// Used percentage at or above which a sample counts as an alert
    pub alert_threshold_pct: f64,
    /// Log every sample at info level
    pub log_enabled: bool,
    /// Name attached to every log line
    pub label: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            alert_threshold_pct: 90.0,
            log_enabled: false,
            label: "gpu".to_string(),
        }
    }
}

impl MonitorConfig {
    /// Replace zero values with defaults
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.interval.is_zero() {
            self.interval = defaults.interval;
        }
        if self.alert_threshold_pct <= 0.0 {
            self.alert_threshold_pct = defaults.alert_threshold_pct;
        }
        if self.label.is_empty() {
            self.label = defaults.label;
        }
        self
    }
}

/// Usage monitor statistics
#[derive(Debug, Clone, Serialize)]
pub struct UsageMonitorStats {
    pub running: bool,
    pub checks: u64,
    pub alerts: u64,
    pub errors: u64,
    pub last_sample: Option<UsageSnapshot>,
    pub uptime: Duration,
}

struct UsageInner {
    probe: Arc<dyn UsageProbe>,
    config: MonitorConfig,
    callback: RwLock<Option<UsageCallback>>,
    last: RwLock<Option<UsageSnapshot>>,
    checks: AtomicU64,
    alerts: AtomicU64,
    errors: AtomicU64,
}

impl UsageInner {
    async fn sample(&self) -> Result<UsageSnapshot, ResilienceError> {
        self.checks.fetch_add(1, Ordering::Relaxed);

        let usage = match self.probe.sample().await {
            Ok(usage) => usage,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(monitor = %self.config.label, error = %e, "Usage sample failed");
                return Err(e);
            }
        };

        *self.last.write() = Some(usage.clone());

        let used_pct = usage.used_pct();
        if self.config.log_enabled {
            info!(
                monitor = %self.config.label,
                used_pct,
                used_gib = usage.used_bytes as f64 / GIB,
                free_gib = usage.free_bytes as f64 / GIB,
                "Memory sample"
            );
        }

        if used_pct >= self.config.alert_threshold_pct {
            self.alerts.fetch_add(1, Ordering::Relaxed);
            warn!(
                monitor = %self.config.label,
                used_pct,
                threshold_pct = self.config.alert_threshold_pct,
                "⚠️  High memory usage"
            );
        } else {
            debug!(monitor = %self.config.label, used_pct, "Memory within threshold");
        }

        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(&usage);
        }

        Ok(usage)
    }
}

#[async_trait]
impl PeriodicCheck for UsageInner {
    async fn run_check(&self) {
        // Failures are counted and logged inside `sample`
        let _ = self.sample().await;
    }
}

/// Periodically samples a [`UsageProbe`]
pub struct UsageMonitor {
    inner: Arc<UsageInner>,
    runner: MonitorLoop,
}

impl UsageMonitor {
    pub fn new(probe: Arc<dyn UsageProbe>, config: MonitorConfig) -> Self {
        let config = config.normalized();
        let runner = MonitorLoop::new("usage", config.interval);
        Self {
            inner: Arc::new(UsageInner {
                probe,
                config,
                callback: RwLock::new(None),
                last: RwLock::new(None),
                checks: AtomicU64::new(0),
                alerts: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
            runner,
        }
    }

    /// Invoke `callback` after every successful sample
    pub fn with_callback<F>(self, callback: F) -> Self
    where
        F: Fn(&UsageSnapshot) + Send + Sync + 'static,
    {
        self.set_callback(callback);
        self
    }

    /// Replace the sample callback. Takes effect from the next sample, even
    /// while the monitor is running.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&UsageSnapshot) + Send + Sync + 'static,
    {
        *self.inner.callback.write() = Some(Arc::new(callback));
    }

    /// Start sampling in the background. No-op if already running.
    pub fn start(&self, parent: &CancellationToken) -> bool {
        let started = self.runner.start(parent, Arc::clone(&self.inner));
        if started {
            info!(
                monitor = %self.inner.config.label,
                interval = ?self.inner.config.interval,
                "Usage monitor started"
            );
        }
        started
    }

    pub async fn stop(&self) {
        self.runner.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    /// Take one sample now, outside the periodic schedule
    pub async fn check_now(&self) -> Result<UsageSnapshot, ResilienceError> {
        self.inner.sample().await
    }

    pub fn last_snapshot(&self) -> Option<UsageSnapshot> {
        self.inner.last.read().clone()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> UsageMonitorStats {
        UsageMonitorStats {
            running: self.is_running(),
            checks: self.inner.checks.load(Ordering::Relaxed),
            alerts: self.inner.alerts.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            last_sample: self.last_snapshot(),
            uptime: self.runner.uptime(),
        }
    }
}
