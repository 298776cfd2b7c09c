//! Call context: deadline and cancellation carried through every suspension point
//!
//! A [`CallContext`] travels with a request from the caller down to the pool.
//! Every place that can wait (pool acquisition, retry backoff, engine calls)
//! races its work against the context so that a cancelled or expired caller
//! never leaves a resource half-acquired.
//!
//! # Example
//!
//! ```
//! use hearth_core_resilience::CallContext;
//! use std::time::Duration;
//!
//! let ctx = CallContext::background().with_timeout(Duration::from_secs(5));
//! assert!(ctx.deadline().is_some());
//! assert!(ctx.check().is_ok());
//! ```

use crate::error::ResilienceError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation scope for a single call
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// A context with no deadline that is never cancelled unless asked to be
    pub fn background() -> Self {
        Self::default()
    }

    /// Set an absolute deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tie this context to an external cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Derive a context cancelled together with this one, with an optional
    /// tighter deadline. The child never outlives the parent's deadline.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout) {
            (Some(parent), Some(t)) => Some(parent.min(Instant::now() + t)),
            (None, Some(t)) => Some(Instant::now() + t),
            (parent, None) => parent,
        };
        Self {
            deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left until the deadline, `None` if there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel this context and every child derived from it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast if the caller has given up
    pub fn check(&self) -> Result<(), ResilienceError> {
        if self.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }
        if self.is_expired() {
            return Err(ResilienceError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first. The future is dropped on early exit.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ResilienceError>
    where
        F: Future,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    out = fut => Ok(out),
                    _ = self.cancel.cancelled() => Err(ResilienceError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Err(ResilienceError::DeadlineExceeded),
                }
            }
            None => {
                tokio::select! {
                    out = fut => Ok(out),
                    _ = self.cancel.cancelled() => Err(ResilienceError::Cancelled),
                }
            }
        }
    }

    /// Sleep for `duration`, returning early with an error if the context ends
    pub async fn sleep(&self, duration: Duration) -> Result<(), ResilienceError> {
        self.run(tokio::time::sleep(duration)).await
    }
}
