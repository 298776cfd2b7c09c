/*!
 * Hearth - resilient local inference runtime
 *
 * Wraps a native inference backend with:
 * - A bounded pool of reusable contexts with deadline-aware acquisition
 * - Retry with exponential backoff and escalating recovery
 *   (context reset, model reload, degraded mode)
 * - Periodic memory usage and health monitors
 * - TOML configuration and structured logging
 *
 * Pure-logic primitives live in `hearth-core-resilience` and are
 * re-exported here.
 */

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod recovery;
pub mod service;
pub mod sim;

// Re-export commonly used types
pub use config::{HearthConfig, LogLevel, LoggingConfig};
pub use engine::{Backend, Engine, Loader, UsageProbe};
pub use error::{HearthError, Result};
pub use monitor::{
    HealthChecker, HealthCheckerConfig, HealthSource, MonitorConfig, UsageMonitor,
};
pub use recovery::{
    RecoveryAction, RecoveryConfig, RecoveryHooks, RecoveryManager, RecoveryManagerBuilder,
    RecoveryStats,
};
pub use service::Service;

pub use hearth_core_resilience::{
    CallContext, ExponentialBackoff, HealthPolicy, HealthSnapshot, PoolConfig, PoolStats,
    RecoveryMode, RequestStats, ResilienceError, ResourcePool, UsageSnapshot,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
