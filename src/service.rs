/*!
 * Pooled service: a [`Backend`] served through a bounded [`ResourcePool`]
 *
 * Each request checks out one native context, runs on it, and hands it
 * back. The service implements [`Engine`], so it can be wrapped by a
 * [`RecoveryManager`](crate::recovery::RecoveryManager) and swapped on
 * model reload.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use hearth_core_resilience::{
    CallContext, HealthSnapshot, PoolConfig, PoolStats, RequestStats, ResilienceError,
    ResourceFactory, ResourcePool,
};

use crate::engine::{Backend, Engine, UsageProbe};

/// Acquire-timeout rate above which the service reports itself unhealthy
pub const MAX_TIMEOUT_RATE: f64 = 0.1;

/// Error rate above which the service reports itself unhealthy
pub const MAX_SERVICE_ERROR_RATE: f64 = 0.2;

/// Adapts a [`Backend`] to the pool's factory seam
struct ContextFactory<B: Backend> {
    backend: Arc<B>,
}

#[async_trait]
impl<B: Backend> ResourceFactory<B::Context> for ContextFactory<B> {
    async fn create(&self) -> Result<B::Context, ResilienceError> {
        self.backend.create_context().await
    }

    fn reset(&self, context: &mut B::Context) {
        self.backend.clear_context(context);
    }

    fn destroy(&self, context: B::Context) {
        self.backend.destroy_context(context);
    }
}

/// Engine built from a backend and a pool of its contexts
pub struct Service<B: Backend> {
    backend: Arc<B>,
    pool: ResourcePool<B::Context>,
    usage: Option<Arc<dyn UsageProbe>>,
    requests: Mutex<RequestStats>,
    closed: AtomicBool,
    started: Instant,
}

impl<B: Backend> Service<B> {
    /// Build the pool (creating `prewarm` contexts up front)
    pub async fn new(backend: B, config: PoolConfig) -> Result<Self, ResilienceError> {
        let backend = Arc::new(backend);
        let factory = Arc::new(ContextFactory {
            backend: Arc::clone(&backend),
        });
        let pool = ResourcePool::new(config, factory).await?;

        info!(
            capacity = pool.capacity(),
            prewarm = pool.config().prewarm,
            "Service started"
        );

        Ok(Self {
            backend,
            pool,
            usage: None,
            requests: Mutex::new(RequestStats::default()),
            closed: AtomicBool::new(false),
            started: Instant::now(),
        })
    }

    /// Include memory readings from `probe` in health snapshots
    pub fn with_usage_probe(mut self, probe: Arc<dyn UsageProbe>) -> Self {
        self.usage = Some(probe);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn pool(&self) -> &ResourcePool<B::Context> {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn request_stats(&self) -> RequestStats {
        self.requests.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn record(&self, started: Instant, ok: bool) {
        let mut stats = self.requests.lock();
        stats.total_requests += 1;
        if ok {
            stats.total_duration += started.elapsed();
        } else {
            stats.errors += 1;
        }
        stats.last_request = Some(Utc::now());
    }

    async fn run_once(
        &self,
        ctx: &CallContext,
        request: &B::Request,
    ) -> Result<B::Output, ResilienceError> {
        if self.is_closed() {
            return Err(ResilienceError::Closed("service"));
        }

        let mut context = self.pool.acquire(ctx).await?;
        let result = ctx
            .run(self.backend.run(ctx, &mut *context, request))
            .await
            .and_then(|out| out);

        // A context that hit a fatal native error is not trusted again
        if matches!(result, Err(ResilienceError::Fatal(_))) {
            context.discard();
        }
        result
    }
}

#[async_trait]
impl<B: Backend> Engine for Service<B> {
    type Request = B::Request;
    type Output = B::Output;

    async fn infer(
        &self,
        ctx: &CallContext,
        request: &B::Request,
    ) -> Result<B::Output, ResilienceError> {
        let started = Instant::now();
        let result = self.run_once(ctx, request).await;
        self.record(started, result.is_ok());

        if let Err(e) = &result {
            debug!(error = %e, "Inference failed");
        }
        result
    }

    async fn health_probe(&self) -> HealthSnapshot {
        let mut snapshot = if self.is_closed() {
            HealthSnapshot::unhealthy("service closed")
        } else {
            HealthSnapshot::healthy("healthy")
        };

        let pool = self.pool.stats();
        let requests = self.request_stats();

        if !self.is_closed() {
            let timeout_rate = pool.timeout_rate();
            // +1 keeps a single early failure from tripping the verdict
            let error_rate = requests.errors as f64 / (requests.total_requests + 1) as f64;

            if timeout_rate > MAX_TIMEOUT_RATE {
                snapshot.healthy = false;
                snapshot.status = format!("high pool timeout rate: {:.1}%", timeout_rate * 100.0);
            } else if error_rate > MAX_SERVICE_ERROR_RATE {
                snapshot.healthy = false;
                snapshot.status = format!("high error rate: {:.1}%", error_rate * 100.0);
            }
        }

        if let Some(probe) = &self.usage {
            match probe.sample().await {
                Ok(usage) => snapshot.usage = Some(usage),
                Err(e) => debug!(error = %e, "Usage sample unavailable"),
            }
        }

        snapshot.pool = Some(pool);
        snapshot.requests = Some(requests);
        snapshot.uptime = self.started.elapsed();
        snapshot
    }

    /// Verify the engine, then recreate every idle context
    async fn reset(&self) -> Result<(), ResilienceError> {
        if self.is_closed() {
            return Err(ResilienceError::Closed("service"));
        }

        let snapshot = self.health_probe().await;
        let recycled = self.pool.recycle_idle();

        if snapshot.healthy {
            info!(recycled, "Context reset completed");
            Ok(())
        } else {
            warn!(recycled, status = %snapshot.status, "Context reset: health check failed");
            Err(ResilienceError::Transient(snapshot.status))
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close();
        self.backend.shutdown().await;
        info!("Service closed");
    }
}
