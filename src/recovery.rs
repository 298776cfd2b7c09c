/*!
 * Recovery manager: retry, reset, reload, degrade
 *
 * Wraps an [`Engine`] and keeps it serving across failures:
 *
 * 1. Recoverable failures are retried with exponential backoff.
 * 2. Enough consecutive failures trigger a context reset.
 * 3. Enough context resets trigger a model reload through the [`Loader`];
 *    the new engine is swapped in atomically and the old one is closed in
 *    the background.
 * 4. Once model reloads are exhausted the manager enters degraded mode and
 *    sheds every request until a background probe (health check, then a
 *    canary request) shows the engine has recovered.
 *
 * Recovery actions are serialized through one async lock, and the
 * escalation condition is re-checked under that lock, so concurrent
 * failures produce at most one action per threshold crossing.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hearth_core_resilience::{
    CallContext, Escalation, EscalationPolicy, ExponentialBackoff, RecoveryMode, RecoveryState,
    ResilienceError,
};

use crate::engine::{Engine, Loader};

/// Recovery action reported to hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    ContextReset,
    ModelReload,
    DegradedMode,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::ContextReset => "context_reset",
            RecoveryAction::ModelReload => "model_reload",
            RecoveryAction::DegradedMode => "degraded_mode",
        };
        f.write_str(name)
    }
}

pub type RecoveryAttemptHook =
    Arc<dyn Fn(RecoveryAction, u32, Option<&ResilienceError>) + Send + Sync>;
pub type DegradedEnterHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type DegradedExitHook = Arc<dyn Fn() + Send + Sync>;

/// Optional observers of recovery activity. Hooks run on the task that
/// triggered the action, outside every internal lock.
#[derive(Clone, Default)]
pub struct RecoveryHooks {
    pub on_recovery_attempt: Option<RecoveryAttemptHook>,
    pub on_degraded_enter: Option<DegradedEnterHook>,
    pub on_degraded_exit: Option<DegradedExitHook>,
}

impl RecoveryHooks {
    fn recovery_attempt(&self, action: RecoveryAction, count: u32, err: Option<&ResilienceError>) {
        if let Some(hook) = &self.on_recovery_attempt {
            hook(action, count, err);
        }
    }

    fn degraded_enter(&self, reason: &str) {
        if let Some(hook) = &self.on_degraded_enter {
            hook(reason);
        }
    }

    fn degraded_exit(&self) {
        if let Some(hook) = &self.on_degraded_exit {
            hook();
        }
    }
}

impl std::fmt::Debug for RecoveryHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryHooks")
            .field("on_recovery_attempt", &self.on_recovery_attempt.is_some())
            .field("on_degraded_enter", &self.on_degraded_enter.is_some())
            .field("on_degraded_exit", &self.on_degraded_exit.is_some())
            .finish()
    }
}

/// Configuration for the recovery manager
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Attempts per request, including the first
    pub max_retries: u32,
    pub backoff: ExponentialBackoff,
    pub escalation: EscalationPolicy,
    /// Shed load once recovery is exhausted. When false the manager keeps
    /// retrying and escalating forever.
    pub degraded_mode_enabled: bool,
    /// How often the background task probes while degraded
    pub recovery_interval: Duration,
    /// Upper bound on one model load
    pub reload_timeout: Duration,
    /// Upper bound on one canary request
    pub canary_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
            escalation: EscalationPolicy::default(),
            degraded_mode_enabled: true,
            recovery_interval: Duration::from_secs(60),
            reload_timeout: Duration::from_secs(300),
            canary_timeout: Duration::from_secs(30),
        }
    }
}

impl RecoveryConfig {
    /// Replace zero values with defaults
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();

        if self.max_retries == 0 {
            self.max_retries = defaults.max_retries;
        }
        if self.backoff.initial.is_zero() {
            self.backoff.initial = defaults.backoff.initial;
        }
        if self.backoff.max.is_zero() {
            self.backoff.max = defaults.backoff.max;
        }
        if self.backoff.multiplier <= 0.0 || !self.backoff.multiplier.is_finite() {
            self.backoff.multiplier = defaults.backoff.multiplier;
        }
        if self.escalation.context_reset_threshold == 0 {
            self.escalation.context_reset_threshold = defaults.escalation.context_reset_threshold;
        }
        if self.escalation.model_reload_threshold == 0 {
            self.escalation.model_reload_threshold = defaults.escalation.model_reload_threshold;
        }
        if self.recovery_interval.is_zero() {
            self.recovery_interval = defaults.recovery_interval;
        }
        if self.reload_timeout.is_zero() {
            self.reload_timeout = defaults.reload_timeout;
        }
        if self.canary_timeout.is_zero() {
            self.canary_timeout = defaults.canary_timeout;
        }
        self
    }
}

/// Recovery statistics
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub retry_attempts: u64,
    pub context_resets: u64,
    pub model_reloads: u64,
    pub model_reload_failures: u64,
    pub degraded_entries: u64,
    pub degraded_recoveries: u64,
    /// Requests issued by the degraded-mode probe; not part of `total_requests`
    pub canary_attempts: u64,
    pub consecutive_failures: u32,
    pub mode: RecoveryMode,
    pub in_degraded_mode: bool,
    pub degraded_reason: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub uptime: Duration,
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    retry_attempts: AtomicU64,
    context_resets: AtomicU64,
    model_reloads: AtomicU64,
    model_reload_failures: AtomicU64,
    degraded_entries: AtomicU64,
    degraded_recoveries: AtomicU64,
    canary_attempts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct ManagerInner<E: Engine> {
    engine: RwLock<Arc<E>>,
    state: Mutex<RecoveryState>,
    /// Serializes reset/reload actions
    recovery_lock: tokio::sync::Mutex<()>,
    config: RecoveryConfig,
    loader: Option<Arc<dyn Loader<E>>>,
    canary: Option<E::Request>,
    hooks: RecoveryHooks,
    counters: Counters,
    shutdown: CancellationToken,
    started: Instant,
}

impl<E: Engine> ManagerInner<E> {
    fn engine(&self) -> Arc<E> {
        Arc::clone(&self.engine.read())
    }

    fn degraded_reason(&self) -> Option<String> {
        let state = self.state.lock();
        if state.mode.is_degraded() {
            Some(
                state
                    .degraded_reason
                    .clone()
                    .unwrap_or_else(|| "recovery exhausted".to_string()),
            )
        } else {
            None
        }
    }

    fn is_degraded(&self) -> bool {
        self.state.lock().mode.is_degraded()
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        request: &E::Request,
    ) -> Result<E::Output, ResilienceError> {
        bump(&self.counters.total_requests);

        if let Some(reason) = self.degraded_reason() {
            return Err(ResilienceError::Degraded(reason));
        }

        let max_retries = self.config.max_retries;
        let mut delays = self.config.backoff.delays();
        let mut last_err = None;

        for attempt in 1..=max_retries {
            ctx.check()?;

            let engine = self.engine();
            let err = match engine.infer(ctx, request).await {
                Ok(output) => {
                    self.record_success();
                    return Ok(output);
                }
                Err(err) => err,
            };

            if !err.is_recoverable() {
                debug!(error = %err, "Non-recoverable error, not retrying");
                return Err(err);
            }

            self.state.lock().record_failure();
            bump(&self.counters.retry_attempts);
            warn!(attempt, max_retries, error = %err, "Attempt failed");
            self.hooks
                .recovery_attempt(RecoveryAction::Retry, attempt, Some(&err));

            self.escalate().await;
            last_err = Some(err);

            if attempt < max_retries {
                let delay = delays.next().unwrap_or(self.config.backoff.max);
                ctx.sleep(delay).await?;
            }
        }

        let last = last_err.unwrap_or_else(|| ResilienceError::Transient("no attempt made".into()));
        warn!(attempts = max_retries, "All retry attempts exhausted");
        self.check_degraded(&last);

        Err(ResilienceError::RetriesExhausted {
            attempts: max_retries as usize,
            last: Box::new(last),
        })
    }

    fn record_success(&self) {
        bump(&self.counters.successful_requests);
        self.state.lock().record_success();
    }

    /// Run whatever recovery action the counters call for
    async fn escalate(&self) {
        let policy = self.config.escalation;
        if self.state.lock().pending_escalation(&policy).is_none() {
            return;
        }

        let _guard = self.recovery_lock.lock().await;

        // Another caller may have acted while we waited for the lock
        let pending = self.state.lock().pending_escalation(&policy);
        match pending {
            Some(Escalation::ContextReset) => self.reset_contexts().await,
            Some(Escalation::ModelReload) => {
                self.reload_model().await;
            }
            None => debug!("Escalation already handled by another caller"),
        }
    }

    /// Caller must hold `recovery_lock`
    async fn reset_contexts(&self) {
        info!("Attempting context reset");

        match self.engine().reset().await {
            Ok(()) => info!("Context reset completed"),
            Err(e) => warn!(error = %e, "Context reset health check failed"),
        }

        let count = {
            let mut state = self.state.lock();
            state.context_reset_completed();
            state.context_reset_count
        };
        bump(&self.counters.context_resets);
        self.hooks
            .recovery_attempt(RecoveryAction::ContextReset, count, None);
    }

    /// Caller must hold `recovery_lock`. Returns whether a new engine was
    /// swapped in; a failed reload still counts toward the reload budget.
    async fn reload_model(&self) -> bool {
        info!("Attempting model reload");

        let outcome = match &self.loader {
            Some(loader) => {
                let ctx = CallContext::background()
                    .with_cancellation(self.shutdown.child_token())
                    .with_timeout(self.config.reload_timeout);
                ctx.run(loader.load(&ctx)).await.and_then(|loaded| loaded)
            }
            None => Err(ResilienceError::NotFound(
                "model reload not available: no loader configured".to_string(),
            )),
        };

        let (reloaded, err) = match outcome {
            Ok(engine) => {
                let old = std::mem::replace(&mut *self.engine.write(), Arc::new(engine));
                tokio::spawn(async move {
                    old.close().await;
                    debug!("Previous engine closed");
                });
                bump(&self.counters.model_reloads);
                info!("Model reload completed successfully");
                (true, None)
            }
            Err(e) => {
                bump(&self.counters.model_reload_failures);
                error!(error = %e, "Model reload failed");
                (false, Some(e))
            }
        };

        let count = {
            let mut state = self.state.lock();
            state.model_reload_completed();
            state.model_reload_count
        };
        self.hooks
            .recovery_attempt(RecoveryAction::ModelReload, count, err.as_ref());
        reloaded
    }

    fn check_degraded(&self, last: &ResilienceError) {
        if !self.config.degraded_mode_enabled {
            return;
        }

        let reason = format!("exceeded recovery attempts: {}", last);
        let entered = {
            let mut state = self.state.lock();
            state.reloads_exhausted(&self.config.escalation) && state.enter_degraded(reason.clone())
        };

        if entered {
            bump(&self.counters.degraded_entries);
            warn!(reason = %reason, "Entering degraded mode");
            self.hooks.degraded_enter(&reason);
            self.hooks.recovery_attempt(
                RecoveryAction::DegradedMode,
                0,
                Some(&ResilienceError::Degraded(reason)),
            );
        }
    }

    fn exit_degraded(&self) {
        if self.state.lock().exit_degraded() {
            bump(&self.counters.degraded_recoveries);
            info!("Exiting degraded mode - service recovered");
            self.hooks.degraded_exit();
        }
    }

    /// One probe of the degraded-mode recovery task
    async fn attempt_degraded_recovery(&self) {
        info!("Attempting recovery from degraded mode");

        let engine = self.engine();
        let snapshot = engine.health_probe().await;

        if snapshot.healthy {
            if let Some(canary) = &self.canary {
                bump(&self.counters.canary_attempts);
                let ctx = CallContext::background()
                    .with_cancellation(self.shutdown.child_token())
                    .with_timeout(self.config.canary_timeout);
                if let Err(e) = engine.infer(&ctx, canary).await {
                    warn!(error = %e, "Degraded mode recovery: canary request failed");
                    return;
                }
            }
            self.exit_degraded();
            return;
        }

        debug!(status = %snapshot.status, "Degraded mode recovery: engine unhealthy");
        if self.loader.is_none() {
            return;
        }

        let _guard = self.recovery_lock.lock().await;
        if self.reload_model().await && self.engine().health_probe().await.healthy {
            self.exit_degraded();
        }
    }

    async fn recovery_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.recovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.is_degraded() {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = self.attempt_degraded_recovery() => {}
                        }
                    }
                }
            }
        }

        debug!("Recovery task stopped");
    }

    fn stats(&self) -> RecoveryStats {
        let state = self.state.lock().clone();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        RecoveryStats {
            total_requests: load(&self.counters.total_requests),
            successful_requests: load(&self.counters.successful_requests),
            retry_attempts: load(&self.counters.retry_attempts),
            context_resets: load(&self.counters.context_resets),
            model_reloads: load(&self.counters.model_reloads),
            model_reload_failures: load(&self.counters.model_reload_failures),
            degraded_entries: load(&self.counters.degraded_entries),
            degraded_recoveries: load(&self.counters.degraded_recoveries),
            canary_attempts: load(&self.counters.canary_attempts),
            consecutive_failures: state.consecutive_failures,
            mode: state.mode,
            in_degraded_mode: state.mode.is_degraded(),
            degraded_reason: state.degraded_reason,
            last_success: state.last_success,
            last_failure: state.last_failure,
            uptime: self.started.elapsed(),
        }
    }
}

/// Builder for [`RecoveryManager`]
pub struct RecoveryManagerBuilder<E: Engine> {
    engine: Arc<E>,
    config: RecoveryConfig,
    loader: Option<Arc<dyn Loader<E>>>,
    canary: Option<E::Request>,
    hooks: RecoveryHooks,
}

impl<E: Engine> RecoveryManagerBuilder<E> {
    pub fn config(mut self, config: RecoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Loader used for model reloads. Without one, reloads always fail.
    pub fn loader(mut self, loader: Arc<dyn Loader<E>>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Request sent straight to the engine to confirm recovery from degraded
    /// mode. Without one, a healthy probe alone ends degraded mode.
    pub fn canary(mut self, request: E::Request) -> Self {
        self.canary = Some(request);
        self
    }

    pub fn hooks(mut self, hooks: RecoveryHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn on_recovery_attempt<F>(mut self, hook: F) -> Self
    where
        F: Fn(RecoveryAction, u32, Option<&ResilienceError>) + Send + Sync + 'static,
    {
        self.hooks.on_recovery_attempt = Some(Arc::new(hook));
        self
    }

    pub fn on_degraded_enter<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.on_degraded_enter = Some(Arc::new(hook));
        self
    }

    pub fn on_degraded_exit<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.on_degraded_exit = Some(Arc::new(hook));
        self
    }

    /// Build the manager and start its recovery task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> RecoveryManager<E> {
        let config = self.config.normalized();
        info!(
            max_retries = config.max_retries,
            context_reset_threshold = config.escalation.context_reset_threshold,
            model_reload_threshold = config.escalation.model_reload_threshold,
            degraded_mode = config.degraded_mode_enabled,
            "Recovery manager started"
        );

        let inner = Arc::new(ManagerInner {
            engine: RwLock::new(self.engine),
            state: Mutex::new(RecoveryState::new()),
            recovery_lock: tokio::sync::Mutex::new(()),
            config,
            loader: self.loader,
            canary: self.canary,
            hooks: self.hooks,
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
            started: Instant::now(),
        });

        let task = tokio::spawn(Arc::clone(&inner).recovery_loop());

        RecoveryManager {
            inner,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Engine wrapper that retries, escalates and sheds load
pub struct RecoveryManager<E: Engine> {
    inner: Arc<ManagerInner<E>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Engine> RecoveryManager<E> {
    pub fn builder(engine: Arc<E>) -> RecoveryManagerBuilder<E> {
        RecoveryManagerBuilder {
            engine,
            config: RecoveryConfig::default(),
            loader: None,
            canary: None,
            hooks: RecoveryHooks::default(),
        }
    }

    /// Manager without a loader or canary
    pub fn new(engine: Arc<E>, config: RecoveryConfig) -> Self {
        Self::builder(engine).config(config).build()
    }

    /// Run `request` with retry and escalating recovery.
    ///
    /// Returns [`ResilienceError::Degraded`] without touching the engine
    /// while degraded, the error itself when it is not recoverable, and
    /// [`ResilienceError::RetriesExhausted`] once every attempt failed.
    pub async fn execute(
        &self,
        ctx: &CallContext,
        request: &E::Request,
    ) -> Result<E::Output, ResilienceError> {
        self.inner.execute(ctx, request).await
    }

    /// The engine currently serving requests
    pub fn engine(&self) -> Arc<E> {
        self.inner.engine()
    }

    /// Whether requests are being accepted
    pub fn is_healthy(&self) -> bool {
        !self.inner.is_degraded()
    }

    pub fn mode(&self) -> RecoveryMode {
        self.inner.state.lock().mode
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> RecoveryStats {
        self.inner.stats()
    }

    /// Stop the recovery task and wait for it to exit. Idempotent.
    ///
    /// The engine is left open; close it through [`RecoveryManager::engine`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Recovery task panicked");
            }
        }
    }
}

impl<E: Engine> Drop for RecoveryManager<E> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
