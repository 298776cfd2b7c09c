/*!
 * Periodic monitors
 *
 * Both monitors share one loop shape ([`MonitorLoop`]): an immediate check
 * on start, then one check per interval until the parent token is
 * cancelled or [`MonitorLoop::stop`] is called.
 */

pub mod health;
pub mod usage;

pub use health::{HealthChecker, HealthCheckerConfig, HealthCheckerStats, HealthSource};
pub use usage::{MonitorConfig, UsageMonitor, UsageMonitorStats};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// One iteration of a monitor
#[async_trait]
pub trait PeriodicCheck: Send + Sync + 'static {
    async fn run_check(&self);
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
    started: Instant,
}

/// Background task driver shared by every monitor
pub struct MonitorLoop {
    name: &'static str,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl MonitorLoop {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            running: Mutex::new(None),
        }
    }

    /// Spawn the loop. Returns false (and does nothing) if it is already running.
    pub fn start<C: PeriodicCheck>(&self, parent: &CancellationToken, check: Arc<C>) -> bool {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return false;
        }

        let token = parent.child_token();
        let task = tokio::spawn(run_loop(self.name, self.interval, token.clone(), check));
        *running = Some(Running {
            token,
            task,
            started: Instant::now(),
        });
        true
    }

    /// Cancel the loop and wait for it to exit. Safe to call when stopped.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.token.cancel();
            if let Err(e) = running.task.await {
                error!(monitor = self.name, error = %e, "Monitor task panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Time since the most recent start
    pub fn uptime(&self) -> Duration {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.started.elapsed())
            .unwrap_or_default()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for MonitorLoop {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.token.cancel();
        }
    }
}

async fn run_loop<C: PeriodicCheck>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    check: Arc<C>,
) {
    debug!(monitor = name, interval = ?period, "Monitor started");

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick fires immediately
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = check.run_check() => {}
                }
            }
        }
    }

    debug!(monitor = name, "Monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingCheck {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicCheck for CountingCheck {
        async fn run_check(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_then_periodic_checks() {
        let check = Arc::new(CountingCheck::default());
        let monitor = MonitorLoop::new("test", Duration::from_secs(1));
        let root = CancellationToken::new();

        assert!(monitor.start(&root, Arc::clone(&check)));
        assert!(!monitor.start(&root, Arc::clone(&check)));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        // t=0, t=1s, t=2s
        assert_eq!(check.runs.load(Ordering::SeqCst), 3);

        monitor.stop().await;
        assert!(!monitor.is_running());
        monitor.stop().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(check.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_loop() {
        let check = Arc::new(CountingCheck::default());
        let monitor = MonitorLoop::new("test", Duration::from_secs(1));
        let root = CancellationToken::new();

        monitor.start(&root, Arc::clone(&check));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(monitor.is_running());

        root.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!monitor.is_running());

        // A stopped loop can be started again under a fresh parent
        assert!(monitor.start(&CancellationToken::new(), check));
        monitor.stop().await;
    }
}
