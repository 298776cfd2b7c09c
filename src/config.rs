/*!
 * Configuration types for Hearth
 *
 * The file format is TOML. Every field has a default, so an empty file is
 * a valid configuration. Durations are written in milliseconds.
 *
 * ```toml
 * [pool]
 * capacity = 4
 * prewarm = 4
 *
 * [recovery]
 * max_retries = 5
 * initial_backoff_ms = 250
 *
 * [logging]
 * level = "debug"
 * ```
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hearth_core_resilience::{EscalationPolicy, ExponentialBackoff, HealthPolicy, PoolConfig};

use crate::error::{HearthError, Result};
use crate::monitor::{HealthCheckerConfig, MonitorConfig};
use crate::recovery::RecoveryConfig;

/// Largest accepted backoff growth factor
pub const MAX_BACKOFF_MULTIPLIER: f64 = 100.0;

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HearthConfig {
    pub pool: PoolSection,
    pub recovery: RecoverySection,
    pub usage_monitor: UsageMonitorSection,
    pub health: HealthSection,
    pub logging: LoggingConfig,
}

/// `[pool]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Maximum number of live contexts
    pub capacity: usize,

    /// Contexts created at startup (0 = fully lazy)
    pub prewarm: usize,

    /// Wait budget for callers that set no deadline
    pub acquire_timeout_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            capacity: 3,
            prewarm: 0,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// `[recovery]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,

    /// Consecutive failures before a context reset
    pub context_reset_threshold: u32,

    /// Context resets before a model reload, and reloads before degraded mode
    pub model_reload_threshold: u32,

    pub degraded_mode_enabled: bool,
    pub recovery_interval_ms: u64,
    pub reload_timeout_ms: u64,
    pub canary_timeout_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            context_reset_threshold: 3,
            model_reload_threshold: 2,
            degraded_mode_enabled: true,
            recovery_interval_ms: 60_000,
            reload_timeout_ms: 300_000,
            canary_timeout_ms: 30_000,
        }
    }
}

/// `[usage_monitor]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageMonitorSection {
    pub enabled: bool,
    pub interval_ms: u64,

    /// Used percentage (0-100) that counts as an alert
    pub alert_threshold_pct: f64,

    /// Log every sample, not only alerts
    pub log_enabled: bool,

    pub label: String,
}

impl Default for UsageMonitorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
            alert_threshold_pct: 90.0,
            log_enabled: false,
            label: "gpu".to_string(),
        }
    }
}

/// `[health]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,

    /// Minimum free accelerator memory in bytes; 0 disables the check
    pub min_free_bytes: u64,

    /// Maximum tolerated error rate (0.0-1.0)
    pub max_error_rate: f64,

    /// Requests required before the error rate is judged
    pub min_samples: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 10_000,
            min_free_bytes: 1 << 30,
            max_error_rate: 0.1,
            min_samples: 10,
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    pub level: LogLevel,

    /// Log file path (None = stdout)
    pub file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl HearthConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HearthError::ConfigNotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: HearthConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| HearthError::Config(format!("TOML serialize error: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values that cannot fall back to a default
    pub fn validate(&self) -> Result<()> {
        if self.pool.capacity == 0 {
            return Err(HearthError::Config(
                "pool.capacity must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.health.max_error_rate) {
            return Err(HearthError::Config(format!(
                "health.max_error_rate must be between 0.0 and 1.0, got {}",
                self.health.max_error_rate
            )));
        }
        if !(0.0..=MAX_BACKOFF_MULTIPLIER).contains(&self.recovery.backoff_multiplier) {
            return Err(HearthError::Config(format!(
                "recovery.backoff_multiplier must be between 0.0 and {}, got {}",
                MAX_BACKOFF_MULTIPLIER, self.recovery.backoff_multiplier
            )));
        }
        if self.recovery.initial_backoff_ms > self.recovery.max_backoff_ms
            && self.recovery.max_backoff_ms > 0
        {
            return Err(HearthError::Config(
                "recovery.initial_backoff_ms exceeds recovery.max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        let defaults = PoolConfig::default();
        PoolConfig {
            capacity: self.pool.capacity,
            prewarm: self.pool.prewarm.min(self.pool.capacity),
            acquire_timeout: match self.pool.acquire_timeout_ms {
                0 => defaults.acquire_timeout,
                ms => millis(ms),
            },
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        let r = &self.recovery;
        RecoveryConfig {
            max_retries: r.max_retries,
            backoff: ExponentialBackoff::new(
                millis(r.initial_backoff_ms),
                millis(r.max_backoff_ms),
                r.backoff_multiplier,
            ),
            escalation: EscalationPolicy {
                context_reset_threshold: r.context_reset_threshold,
                model_reload_threshold: r.model_reload_threshold,
            },
            degraded_mode_enabled: r.degraded_mode_enabled,
            recovery_interval: millis(r.recovery_interval_ms),
            reload_timeout: millis(r.reload_timeout_ms),
            canary_timeout: millis(r.canary_timeout_ms),
        }
        .normalized()
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        let m = &self.usage_monitor;
        MonitorConfig {
            interval: millis(m.interval_ms),
            alert_threshold_pct: m.alert_threshold_pct,
            log_enabled: m.log_enabled,
            label: m.label.clone(),
        }
        .normalized()
    }

    pub fn health_checker_config(&self) -> HealthCheckerConfig {
        let h = &self.health;
        HealthCheckerConfig {
            interval: millis(h.interval_ms),
            timeout: millis(h.timeout_ms),
            policy: HealthPolicy {
                min_free_bytes: h.min_free_bytes,
                max_error_rate: h.max_error_rate,
                min_samples: h.min_samples,
            },
        }
        .normalized()
    }
}
