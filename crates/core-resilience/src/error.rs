//! Error types for the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Invalid construction parameters (e.g. a zero-capacity pool)
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// A backing resource (model file, device) is permanently missing
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The pool stayed exhausted until the acquire deadline passed
    #[error("Timed out after {0:?} waiting for a pooled resource")]
    Timeout(Duration),

    /// The caller's deadline passed before the operation could run
    #[error("Caller deadline exceeded")]
    DeadlineExceeded,

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The pool or engine has been closed
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Recoverable execution failure, eligible for retry and escalation
    #[error("Transient error: {0}")]
    Transient(String),

    /// Non-recoverable execution failure
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Circuit is open; requests are shed without being executed
    #[error("Service in degraded mode: {0}")]
    Degraded(String),

    /// Every retry attempt failed
    #[error("Operation failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        last: Box<ResilienceError>,
    },
}

impl ResilienceError {
    /// Check if a failed execution may succeed when retried.
    ///
    /// Cancellation, deadline expiry and permanently missing resources abort
    /// the retry loop immediately; everything else is worth another attempt.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ResilienceError::Cancelled
            | ResilienceError::DeadlineExceeded
            | ResilienceError::NotFound(_)
            | ResilienceError::Fatal(_)
            | ResilienceError::Validation(_)
            | ResilienceError::Degraded(_) => false,
            ResilienceError::RetriesExhausted { last, .. } => last.is_recoverable(),
            ResilienceError::Timeout(_)
            | ResilienceError::Closed(_)
            | ResilienceError::Transient(_) => true,
        }
    }

    /// Check if this error came from load shedding rather than execution
    pub fn is_degraded(&self) -> bool {
        matches!(self, ResilienceError::Degraded(_))
    }

    /// Check if this error is a timeout waiting on the pool
    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::Timeout(_))
    }

    /// The innermost error, unwrapping retry exhaustion
    pub fn root_cause(&self) -> &ResilienceError {
        match self {
            ResilienceError::RetriesExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }
}
