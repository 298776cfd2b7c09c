/*!
 * Engine capabilities
 *
 * Hearth never calls a native inference library directly. Everything it
 * knows about the engine goes through the traits in this module:
 *
 * - [`Engine`]: the top-level capability a [`RecoveryManager`] drives and swaps
 * - [`Backend`]: the per-context native calls a [`Service`] builds an engine from
 * - [`Loader`]: produces a fresh engine during a model reload
 * - [`UsageProbe`]: samples accelerator memory for monitors and health probes
 *
 * [`RecoveryManager`]: crate::recovery::RecoveryManager
 * [`Service`]: crate::service::Service
 */

use async_trait::async_trait;
use hearth_core_resilience::{CallContext, HealthSnapshot, ResilienceError, UsageSnapshot};

/// A loaded model that can serve requests
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Output: Send + 'static;

    /// Run one unit of work
    async fn infer(
        &self,
        ctx: &CallContext,
        request: &Self::Request,
    ) -> Result<Self::Output, ResilienceError>;

    /// Report current health. Never fails; problems are reported in the snapshot.
    async fn health_probe(&self) -> HealthSnapshot;

    /// Bring per-context state back to a known-good baseline.
    ///
    /// The default only verifies the engine with a health probe.
    async fn reset(&self) -> Result<(), ResilienceError> {
        let snapshot = self.health_probe().await;
        if snapshot.healthy {
            Ok(())
        } else {
            Err(ResilienceError::Transient(snapshot.status))
        }
    }

    /// Release every native resource. Idempotent.
    async fn close(&self);
}

/// Native calls bound to one inference context
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// One native context (KV cache, device buffers)
    type Context: Send + 'static;
    type Request: Send + Sync + 'static;
    type Output: Send + 'static;

    async fn create_context(&self) -> Result<Self::Context, ResilienceError>;

    /// Free a context's native memory
    fn destroy_context(&self, context: Self::Context) {
        drop(context);
    }

    /// Clear per-use transient state (e.g. the KV cache)
    fn clear_context(&self, _context: &mut Self::Context) {}

    async fn run(
        &self,
        ctx: &CallContext,
        context: &mut Self::Context,
        request: &Self::Request,
    ) -> Result<Self::Output, ResilienceError>;

    /// Unload the model once every context is gone
    async fn shutdown(&self) {}
}

/// Builds a fresh engine for model reload
#[async_trait]
pub trait Loader<E: Engine>: Send + Sync {
    async fn load(&self, ctx: &CallContext) -> Result<E, ResilienceError>;
}

/// Source of accelerator memory readings
#[async_trait]
pub trait UsageProbe: Send + Sync {
    async fn sample(&self) -> Result<UsageSnapshot, ResilienceError>;
}
