//! Hearth Core Resilience: Pure-logic primitives for keeping a scarce resource alive
//!
//! # Overview
//!
//! This crate provides the building blocks Hearth uses to share a handful of
//! expensive native handles (inference contexts bound to a loaded model and
//! reserved accelerator memory) between many callers, and to recover when
//! those handles start failing:
//!
//! - **Resource Pool**: Bounded reuse of factory-built resources with eager or lazy creation
//! - **Call Context**: Deadline and cancellation carried through every wait
//! - **Backoff**: Exponential, capped retry delays
//! - **Recovery State**: Escalation state machine (reset → reload → degraded)
//! - **Health Policy**: Threshold evaluation of health snapshots
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Inference engines, models or GPU drivers
//! - How snapshots are collected
//! - Configuration files or logging setup
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Service                    │
//! └─────────────┬───────────────────────────┘
//!               │  CallContext (deadline, cancel)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Recovery State                    │  ← Retry, reset, reload, degrade
//! │  (Backoff between attempts)             │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Resource Pool                     │  ← Bounded, owned handles
//! │  (Factory create / reset / destroy)     │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         Native Engine Context
//!
//!  Periodically:
//!   Health Snapshot → Health Policy → Verdict
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use hearth_core_resilience::{CallContext, PoolConfig, ResilienceError, ResourceFactory, ResourcePool};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct GpuContext;
//! struct GpuContextFactory;
//!
//! #[async_trait::async_trait]
//! impl ResourceFactory<GpuContext> for GpuContextFactory {
//!     async fn create(&self) -> Result<GpuContext, ResilienceError> {
//!         Ok(GpuContext)
//!     }
//! }
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let pool = ResourcePool::new(PoolConfig::eager(2), Arc::new(GpuContextFactory)).await?;
//!
//! let ctx = CallContext::background().with_timeout(Duration::from_secs(5));
//! let gpu = pool.acquire(&ctx).await?;
//! // Run inference with gpu...
//! drop(gpu);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod context;
pub mod error;
pub mod health;
pub mod recovery_state;
pub mod resource_pool;

// Re-export main types for convenience
pub use backoff::ExponentialBackoff;
pub use context::CallContext;
pub use error::ResilienceError;
pub use health::{
    HealthConcern, HealthPolicy, HealthSnapshot, HealthVerdict, RequestStats, UsageSnapshot,
};
pub use recovery_state::{
    Escalation, EscalationPolicy, RecoveryEvent, RecoveryMode, RecoveryState,
};
pub use resource_pool::{PoolConfig, PoolStats, PooledResource, ResourceFactory, ResourcePool};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use hearth_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::ExponentialBackoff;
    pub use super::context::CallContext;
    pub use super::error::ResilienceError;
    pub use super::health::{HealthPolicy, HealthSnapshot, UsageSnapshot};
    pub use super::recovery_state::{EscalationPolicy, RecoveryMode, RecoveryState};
    pub use super::resource_pool::{PoolConfig, PooledResource, ResourceFactory, ResourcePool};
}
