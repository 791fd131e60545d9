//! Retry executor for setup operations
//!
//! Schema changes, bulk inserts and bootstrap probes run through [`run`]:
//! transient failures are retried with a constant backoff, anything else, or
//! running out of attempts, becomes [`Error::SetupFailed`]. Workload
//! transactions never go through here; their failures are part of the test.

use std::time::Duration;

use tally_core::{Context, Error, Result};
use tracing::warn;

/// Attempts and backoff for setup operations
///
/// # Example
/// ```ignore
/// let policy = RetryPolicy::default().with_max_attempts(5);
/// retry::run(&ctx, &policy, "create ledger0", || store.exec(&ctx, &stmt))?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (at least 1)
    pub max_attempts: u32,
    /// Constant delay between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the backoff
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Run `op` until it succeeds, fails for good, or the budget is spent
///
/// Cancellation of `ctx` is returned as-is ([`Error::Cancelled`]) so callers
/// can tell a shutdown from a broken setup.
pub fn run<T, F>(ctx: &Context, policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op() {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if err.is_cancellation() || ctx.token().is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !err.is_transient() || attempt >= max_attempts {
            return Err(Error::SetupFailed {
                operation: operation.to_string(),
                attempts: attempt,
                source: Box::new(err),
            });
        }
        warn!(operation, attempt, error = %err, "setup step failed, retrying");
        if let Err(e) = ctx.sleep(policy.backoff) {
            if e.is_cancellation() {
                return Err(e);
            }
            return Err(Error::SetupFailed {
                operation: operation.to_string(),
                attempts: attempt,
                source: Box::new(err),
            });
        }
    }
}
