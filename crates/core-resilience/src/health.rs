//! Health snapshots and the policy that turns them into a verdict
//!
//! Probes produce immutable, timestamped snapshots. A [`HealthPolicy`] is a
//! pure function from a snapshot to a [`HealthVerdict`]; collecting the
//! snapshot and acting on the verdict is left to the caller.
//!
//! # Example
//!
//! ```
//! use hearth_core_resilience::health::{HealthConcern, HealthPolicy, HealthSnapshot, UsageSnapshot};
//!
//! let policy = HealthPolicy {
//!     min_free_bytes: 1 << 30,
//!     ..Default::default()
//! };
//!
//! let mut snapshot = HealthSnapshot::healthy("ok");
//! snapshot.usage = Some(UsageSnapshot::new(15 << 29, 8 << 30)); // 512 MiB free
//!
//! let verdict = policy.evaluate(&snapshot);
//! assert!(!verdict.healthy);
//! assert!(matches!(verdict.concerns[0], HealthConcern::InsufficientMemory { .. }));
//! ```

use crate::resource_pool::PoolStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Accelerator memory usage at one instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub sampled_at: DateTime<Utc>,
}

impl UsageSnapshot {
    /// Build a snapshot from used and total bytes, sampled now
    pub fn new(used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            used_bytes,
            free_bytes: total_bytes.saturating_sub(used_bytes),
            total_bytes,
            sampled_at: Utc::now(),
        }
    }

    /// Usage as a percentage (0.0 - 100.0)
    pub fn used_pct(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

/// Request counters reported by a service
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestStats {
    pub total_requests: u64,
    pub errors: u64,
    pub total_duration: Duration,
    pub last_request: Option<DateTime<Utc>>,
}

impl RequestStats {
    /// Errors per request (0.0 - 1.0)
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.total_requests as f64
        }
    }

    pub fn average_duration(&self) -> Option<Duration> {
        let succeeded = self.total_requests.saturating_sub(self.errors);
        if succeeded == 0 {
            None
        } else {
            u32::try_from(succeeded)
                .ok()
                .map(|n| self.total_duration / n)
        }
    }
}

/// Point-in-time health report for an engine
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// The engine's own verdict
    pub healthy: bool,
    /// Human-readable status
    pub status: String,
    pub pool: Option<PoolStats>,
    pub usage: Option<UsageSnapshot>,
    pub requests: Option<RequestStats>,
    pub uptime: Duration,
    pub checked_at: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn healthy(status: impl Into<String>) -> Self {
        Self::with_verdict(true, status)
    }

    pub fn unhealthy(status: impl Into<String>) -> Self {
        Self::with_verdict(false, status)
    }

    fn with_verdict(healthy: bool, status: impl Into<String>) -> Self {
        Self {
            healthy,
            status: status.into(),
            pool: None,
            usage: None,
            requests: None,
            uptime: Duration::ZERO,
            checked_at: Utc::now(),
        }
    }
}

/// Thresholds applied on top of an engine's own verdict
#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    /// Minimum free accelerator memory; 0 disables the check
    pub min_free_bytes: u64,
    /// Maximum tolerated error rate (0.0 - 1.0)
    pub max_error_rate: f64,
    /// Error rate is only judged once more requests than this were seen
    pub min_samples: u64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            min_free_bytes: 1 << 30, // 1 GiB
            max_error_rate: 0.1,
            min_samples: 10,
        }
    }
}

/// Reason a snapshot failed the policy
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthConcern {
    /// Free memory is below the configured floor
    InsufficientMemory { free_bytes: u64, required_bytes: u64 },

    /// Error rate is above the configured ceiling
    ErrorRateHigh { rate: f64, max_rate: f64 },

    /// The engine itself reported a problem
    EngineReported { status: String },
}

impl std::fmt::Display for HealthConcern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthConcern::InsufficientMemory {
                free_bytes,
                required_bytes,
            } => write!(
                f,
                "insufficient memory (free: {} bytes, required: {} bytes)",
                free_bytes, required_bytes
            ),
            HealthConcern::ErrorRateHigh { rate, max_rate } => write!(
                f,
                "high error rate: {:.2}% (max: {:.2}%)",
                rate * 100.0,
                max_rate * 100.0
            ),
            HealthConcern::EngineReported { status } => f.write_str(status),
        }
    }
}

/// Outcome of applying a policy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthVerdict {
    pub healthy: bool,
    pub concerns: Vec<HealthConcern>,
}

impl HealthVerdict {
    /// One-line summary of every concern
    pub fn reason(&self) -> String {
        self.concerns
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl HealthPolicy {
    pub fn evaluate(&self, snapshot: &HealthSnapshot) -> HealthVerdict {
        let mut concerns = Vec::new();

        if let Some(usage) = &snapshot.usage {
            if usage.free_bytes < self.min_free_bytes {
                concerns.push(HealthConcern::InsufficientMemory {
                    free_bytes: usage.free_bytes,
                    required_bytes: self.min_free_bytes,
                });
            }
        }

        if let Some(requests) = &snapshot.requests {
            if requests.total_requests > self.min_samples {
                let rate = requests.error_rate();
                if rate > self.max_error_rate {
                    concerns.push(HealthConcern::ErrorRateHigh {
                        rate,
                        max_rate: self.max_error_rate,
                    });
                }
            }
        }

        // The engine's own verdict only counts when our thresholds passed
        if concerns.is_empty() && !snapshot.healthy {
            concerns.push(HealthConcern::EngineReported {
                status: snapshot.status.clone(),
            });
        }

        HealthVerdict {
            healthy: concerns.is_empty(),
            concerns,
        }
    }
}
