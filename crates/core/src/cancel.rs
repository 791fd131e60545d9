//! Cooperative cancellation and deadlines
//!
//! A [`CancelToken`] is shared by every task of a run. Cancelling it is
//! idempotent and wakes every thread parked in [`CancelToken::wait_timeout`].
//!
//! A [`Context`] pairs the token with an optional deadline. Each blocking
//! call in the harness takes a `&Context` and gives up with
//! [`Error::Cancelled`] or [`Error::DeadlineExceeded`] once either fires.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct TokenInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Broadcast cancellation signal
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Cancel the token and wake all waiters
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        // Taking the lock orders the store before any waiter's re-check.
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
    }

    /// Whether [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Park for up to `timeout`; returns `true` if the token got cancelled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_cancelled()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Cancellation token plus an optional deadline
#[derive(Clone, Debug)]
pub struct Context {
    token: CancelToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context with no deadline, cancelled through `token`
    pub fn new(token: CancelToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A context nobody else can cancel
    pub fn background() -> Self {
        Self::new(CancelToken::new())
    }

    /// Derive a child whose deadline is at most `timeout` from now
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.clone(),
            deadline: Some(deadline),
        }
    }

    /// The underlying token
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` means unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if cancelled or past the deadline
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Sleep for `duration`, waking early on cancellation
    ///
    /// A sleep that would run past the deadline is cut short and reported as
    /// [`Error::DeadlineExceeded`].
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        let (wait, truncated) = match self.remaining() {
            Some(left) if left < duration => (left, true),
            _ => (duration, false),
        };
        if self.token.wait_timeout(wait) {
            return Err(Error::Cancelled);
        }
        if truncated {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }
}
