//! Recovery escalation state machine
//!
//! Failures escalate through four modes:
//! - Normal: requests run, failures are retried with backoff
//! - ContextReset: the last recovery action reset engine contexts
//! - ModelReload: the last recovery action reloaded the model
//! - Degraded: recovery is exhausted, requests are shed immediately
//!
//! Transitions are driven by [`RecoveryEvent`]s through a single table
//! ([`RecoveryMode::transition`]), so every legal edge is listed in one
//! place. Counters decide *when* an event fires; the table decides *where*
//! it leads.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Current escalation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    Normal,
    ContextReset,
    ModelReload,
    Degraded,
}

/// Something that happened to the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryEvent {
    /// A request succeeded
    Success,
    /// A context-reset action completed
    ContextResetCompleted,
    /// A model-reload action completed (successfully or not)
    ModelReloadCompleted,
    /// Retries were exhausted with model reloads already used up
    RecoveryExhausted,
    /// A canary request succeeded while degraded
    CanarySucceeded,
}

impl RecoveryMode {
    /// Transition table. `None` means the event is not legal in this mode
    /// and the mode does not change.
    pub fn transition(self, event: RecoveryEvent) -> Option<RecoveryMode> {
        use RecoveryEvent as E;
        use RecoveryMode as M;

        match (self, event) {
            (M::Normal | M::ContextReset | M::ModelReload, E::Success) => Some(M::Normal),
            (M::Normal | M::ContextReset | M::ModelReload, E::ContextResetCompleted) => {
                Some(M::ContextReset)
            }
            (M::Normal | M::ContextReset | M::ModelReload, E::ModelReloadCompleted) => {
                Some(M::ModelReload)
            }
            (M::Normal | M::ContextReset | M::ModelReload, E::RecoveryExhausted) => {
                Some(M::Degraded)
            }
            (M::Normal | M::ContextReset | M::ModelReload, E::CanarySucceeded) => None,

            // Reloads attempted by the degraded-mode probe keep the circuit open
            (M::Degraded, E::ModelReloadCompleted) => Some(M::Degraded),
            (M::Degraded, E::CanarySucceeded) => Some(M::Normal),
            (M::Degraded, E::Success | E::ContextResetCompleted | E::RecoveryExhausted) => None,
        }
    }

    pub fn is_degraded(self) -> bool {
        self == RecoveryMode::Degraded
    }
}

impl std::fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecoveryMode::Normal => "normal",
            RecoveryMode::ContextReset => "context_reset",
            RecoveryMode::ModelReload => "model_reload",
            RecoveryMode::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Thresholds that decide when to escalate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// Consecutive failures before a context reset
    pub context_reset_threshold: u32,
    /// Context resets before a model reload, and model reloads before
    /// degraded mode
    pub model_reload_threshold: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            context_reset_threshold: 3,
            model_reload_threshold: 2,
        }
    }
}

/// Recovery action the counters call for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    ContextReset,
    ModelReload,
}

/// Mutable per-manager recovery record
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryState {
    pub mode: RecoveryMode,
    pub consecutive_failures: u32,
    pub context_reset_count: u32,
    pub model_reload_count: u32,
    pub degraded_reason: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryState {
    pub fn new() -> Self {
        Self {
            mode: RecoveryMode::Normal,
            consecutive_failures: 0,
            context_reset_count: 0,
            model_reload_count: 0,
            degraded_reason: None,
            last_success: None,
            last_failure: None,
        }
    }

    fn apply(&mut self, event: RecoveryEvent) -> bool {
        match self.mode.transition(event) {
            Some(next) => {
                self.mode = next;
                true
            }
            None => false,
        }
    }

    fn clear_counters(&mut self) {
        self.consecutive_failures = 0;
        self.context_reset_count = 0;
        self.model_reload_count = 0;
    }

    /// A request succeeded: every counter starts over
    pub fn record_success(&mut self) {
        if self.apply(RecoveryEvent::Success) {
            self.clear_counters();
            self.last_success = Some(Utc::now());
        }
    }

    /// A request attempt failed with a recoverable error
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure = Some(Utc::now());
    }

    /// The recovery action the counters currently call for, if any
    pub fn pending_escalation(&self, policy: &EscalationPolicy) -> Option<Escalation> {
        if self.mode.is_degraded() {
            return None;
        }
        if self.context_reset_count >= policy.model_reload_threshold {
            return Some(Escalation::ModelReload);
        }
        if self.consecutive_failures >= policy.context_reset_threshold {
            return Some(Escalation::ContextReset);
        }
        None
    }

    pub fn context_reset_completed(&mut self) {
        if self.apply(RecoveryEvent::ContextResetCompleted) {
            self.context_reset_count += 1;
            self.consecutive_failures = 0;
        }
    }

    pub fn model_reload_completed(&mut self) {
        if self.apply(RecoveryEvent::ModelReloadCompleted) && !self.mode.is_degraded() {
            self.model_reload_count += 1;
            self.context_reset_count = 0;
            self.consecutive_failures = 0;
        }
    }

    /// Whether exhausting retries now should open the circuit
    pub fn reloads_exhausted(&self, policy: &EscalationPolicy) -> bool {
        self.model_reload_count >= policy.model_reload_threshold
    }

    /// Open the circuit. Returns false if already degraded.
    pub fn enter_degraded(&mut self, reason: impl Into<String>) -> bool {
        if self.apply(RecoveryEvent::RecoveryExhausted) {
            self.degraded_reason = Some(reason.into());
            true
        } else {
            false
        }
    }

    /// Close the circuit after a successful canary. Returns false if the
    /// manager was not degraded.
    pub fn exit_degraded(&mut self) -> bool {
        if self.apply(RecoveryEvent::CanarySucceeded) {
            self.degraded_reason = None;
            self.clear_counters();
            self.last_success = Some(Utc::now());
            true
        } else {
            false
        }
    }
}
