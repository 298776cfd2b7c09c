/*!
 * Simulated engine for soak runs and tests
 *
 * [`SimBackend`] behaves like a native inference backend: contexts hold a
 * fake KV cache, runs take a fixed latency, and a shared [`FailureInjector`]
 * decides which runs fail. [`SimLoader`] builds fresh services for model
 * reload and [`SimUsageProbe`] reports memory in proportion to live contexts.
 */

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use hearth_core_resilience::{CallContext, PoolConfig, ResilienceError, UsageSnapshot};

use crate::engine::{Backend, Loader, UsageProbe};
use crate::service::Service;

/// Decides which simulated calls fail
#[derive(Debug, Default)]
pub struct FailureInjector {
    failure_rate: Mutex<f64>,
    forced: AtomicBool,
    fail_next: AtomicU32,
    injected: AtomicU64,
}

impl FailureInjector {
    /// Fail each call independently with probability `rate` (clamped to 0.0-1.0)
    pub fn with_rate(rate: f64) -> Arc<Self> {
        let injector = Self::default();
        injector.set_failure_rate(rate);
        Arc::new(injector)
    }

    pub fn set_failure_rate(&self, rate: f64) {
        let rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        *self.failure_rate.lock() = rate;
    }

    /// Fail every call until cleared
    pub fn force_failures(&self, forced: bool) {
        self.forced.store(forced, Ordering::SeqCst);
    }

    /// Fail exactly the next `n` calls, then fall back to the random rate
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Failures injected so far
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    pub fn should_fail(&self) -> bool {
        let fail = self.forced.load(Ordering::SeqCst)
            || self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            || {
                let rate = *self.failure_rate.lock();
                rate > 0.0 && rand::rng().random_bool(rate)
            };

        if fail {
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        fail
    }
}

/// One fake inference context
#[derive(Debug)]
pub struct SimContext {
    pub id: u64,
    /// Tokens currently held in the fake KV cache
    pub kv_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimRequest {
    pub prompt: String,
    pub max_tokens: usize,
}

impl SimRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimOutput {
    pub context_id: u64,
    pub text: String,
    pub tokens: usize,
}

/// Simulated native backend
#[derive(Debug)]
pub struct SimBackend {
    generation: u32,
    injector: Arc<FailureInjector>,
    latency: Duration,
    next_context_id: AtomicU64,
    live_contexts: Arc<AtomicUsize>,
    runs: AtomicU64,
}

impl SimBackend {
    pub fn new(injector: Arc<FailureInjector>, latency: Duration) -> Self {
        Self::with_generation(0, injector, latency, Arc::new(AtomicUsize::new(0)))
    }

    fn with_generation(
        generation: u32,
        injector: Arc<FailureInjector>,
        latency: Duration,
        live_contexts: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            generation,
            injector,
            latency,
            next_context_id: AtomicU64::new(1),
            live_contexts,
            runs: AtomicU64::new(0),
        }
    }

    /// How many times the model has been (re)loaded before this backend
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Shared count of live contexts, for a [`SimUsageProbe`]
    pub fn live_contexts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live_contexts)
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for SimBackend {
    type Context = SimContext;
    type Request = SimRequest;
    type Output = SimOutput;

    async fn create_context(&self) -> Result<SimContext, ResilienceError> {
        let id = self.next_context_id.fetch_add(1, Ordering::SeqCst);
        self.live_contexts.fetch_add(1, Ordering::SeqCst);
        debug!(generation = self.generation, context = id, "Context created");
        Ok(SimContext { id, kv_tokens: 0 })
    }

    fn destroy_context(&self, context: SimContext) {
        self.live_contexts.fetch_sub(1, Ordering::SeqCst);
        debug!(generation = self.generation, context = context.id, "Context destroyed");
    }

    fn clear_context(&self, context: &mut SimContext) {
        context.kv_tokens = 0;
    }

    async fn run(
        &self,
        _ctx: &CallContext,
        context: &mut SimContext,
        request: &SimRequest,
    ) -> Result<SimOutput, ResilienceError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.injector.should_fail() {
            return Err(ResilienceError::Transient(
                "simulated device error".to_string(),
            ));
        }

        let prompt_tokens = request.prompt.split_whitespace().count();
        context.kv_tokens += prompt_tokens + request.max_tokens;

        let text = std::iter::repeat("tok")
            .take(request.max_tokens)
            .collect::<Vec<_>>()
            .join(" ");

        Ok(SimOutput {
            context_id: context.id,
            text,
            tokens: request.max_tokens,
        })
    }

    async fn shutdown(&self) {
        info!(generation = self.generation, runs = self.runs(), "Model unloaded");
    }
}

/// Builds a fresh simulated service on every load
pub struct SimLoader {
    pool: PoolConfig,
    injector: Arc<FailureInjector>,
    load_injector: Arc<FailureInjector>,
    latency: Duration,
    live_contexts: Arc<AtomicUsize>,
    usage: Option<Arc<dyn UsageProbe>>,
    loads: AtomicU32,
}

impl SimLoader {
    /// New services share `injector` (and the live-context count) with the first one
    pub fn new(pool: PoolConfig, injector: Arc<FailureInjector>, backend: &SimBackend) -> Self {
        Self {
            pool,
            injector,
            load_injector: Arc::new(FailureInjector::default()),
            latency: backend.latency,
            live_contexts: backend.live_contexts(),
            usage: None,
            loads: AtomicU32::new(0),
        }
    }

    /// Attach `probe` to every service this loader builds
    pub fn with_usage_probe(mut self, probe: Arc<dyn UsageProbe>) -> Self {
        self.usage = Some(probe);
        self
    }

    /// Injector consulted once per load; a hit fails the load
    pub fn load_injector(&self) -> &FailureInjector {
        &self.load_injector
    }

    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Loader<Service<SimBackend>> for SimLoader {
    async fn load(&self, ctx: &CallContext) -> Result<Service<SimBackend>, ResilienceError> {
        ctx.check()?;
        let generation = self.loads.fetch_add(1, Ordering::SeqCst) + 1;

        if self.load_injector.should_fail() {
            return Err(ResilienceError::Transient(format!(
                "simulated model load failure (generation {})",
                generation
            )));
        }

        let backend = SimBackend::with_generation(
            generation,
            Arc::clone(&self.injector),
            self.latency,
            Arc::clone(&self.live_contexts),
        );
        info!(generation, "Model loaded");
        let service = Service::new(backend, self.pool.clone()).await?;
        Ok(match &self.usage {
            Some(probe) => service.with_usage_probe(Arc::clone(probe)),
            None => service,
        })
    }
}

/// Reports memory use as a base footprint plus a fixed amount per live context
#[derive(Debug)]
pub struct SimUsageProbe {
    total_bytes: u64,
    base_bytes: u64,
    per_context_bytes: u64,
    live_contexts: Arc<AtomicUsize>,
}

impl SimUsageProbe {
    pub fn new(
        total_bytes: u64,
        base_bytes: u64,
        per_context_bytes: u64,
        live_contexts: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            total_bytes,
            base_bytes,
            per_context_bytes,
            live_contexts,
        }
    }
}

#[async_trait]
impl UsageProbe for SimUsageProbe {
    async fn sample(&self) -> Result<UsageSnapshot, ResilienceError> {
        let live = self.live_contexts.load(Ordering::SeqCst) as u64;
        let used = self
            .base_bytes
            .saturating_add(live.saturating_mul(self.per_context_bytes))
            .min(self.total_bytes);
        Ok(UsageSnapshot::new(used, self.total_bytes))
    }
}
