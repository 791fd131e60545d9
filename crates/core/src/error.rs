//! Error types for the tally harness
//!
//! Every failure the harness can observe falls into one of four classes:
//! - transient store failures (connection drops, busy databases, lock waits)
//! - invariant violations (the thing this harness exists to find)
//! - structural setup failures (DDL or bulk load exhausted its retries)
//! - cancellation (shutdown, not an error for reporting purposes)
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::stmt::ShardId;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the harness
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-level or otherwise retryable store failure
    #[error("transient store error: {0}")]
    Transient(String),

    /// A row lock could not be acquired before the lock wait timeout
    #[error("lock wait timeout on {table} row {id}")]
    LockWaitTimeout {
        /// Table holding the contended row
        table: String,
        /// Contended row id
        id: i64,
    },

    /// The operation's own deadline passed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The run is shutting down
    #[error("operation cancelled")]
    Cancelled,

    /// A query or statement referenced a missing table
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Non-retryable store failure
    #[error("store error: {0}")]
    Store(String),

    /// A global invariant does not hold
    #[error("invariant violated: {0}")]
    Violation(Violation),

    /// DDL, bulk insert, or a bootstrap probe failed for good
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    SetupFailed {
        /// Label of the operation that was retried
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Last error observed
        #[source]
        source: Box<Error>,
    },

    /// The barrier marker never showed up downstream
    #[error("barrier table `{table}` not replicated to {store} within {waited:?}")]
    BarrierTimeout {
        /// Barrier table name
        table: String,
        /// Store that was polled
        store: String,
        /// How long we waited
        waited: Duration,
    },

    /// Invalid configuration or DSN
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error (config files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the failure may go away if the operation is repeated
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transient(_) | Error::LockWaitTimeout { .. } | Error::DeadlineExceeded
        )
    }

    /// Whether the failure is the run shutting down
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether the failure must abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Violation(_) | Error::SetupFailed { .. } | Error::BarrierTimeout { .. }
        )
    }

    /// The violation carried by this error, looking through setup wrappers
    pub fn violation(&self) -> Option<&Violation> {
        match self {
            Error::Violation(v) => Some(v),
            Error::SetupFailed { source, .. } => source.violation(),
            _ => None,
        }
    }
}

impl From<Violation> for Error {
    fn from(v: Violation) -> Self {
        Error::Violation(v)
    }
}

/// What exactly did not hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// `SUM(balance)` drifted
    BalanceSum {
        /// `accounts * initial_balance`
        expected: i64,
        /// Observed sum
        observed: i64,
    },
    /// Ledger rows appeared or disappeared
    RowCount {
        /// Configured account count
        expected: i64,
        /// Observed row count
        observed: i64,
    },
    /// Two consecutive sequence values are more than one apart, or regress
    SequenceGap {
        /// Earlier value in ascending order
        previous: i64,
        /// Value that followed it
        current: i64,
    },
}

/// A failed invariant check, with enough context to diagnose it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Shard the check ran against
    pub shard: ShardId,
    /// Scenario name
    pub scenario: &'static str,
    /// Which side was checked (usually the store name)
    pub tag: String,
    /// The broken invariant
    pub kind: ViolationKind,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} scenario on shard {} ({}): ",
            self.scenario, self.shard, self.tag
        )?;
        match &self.kind {
            ViolationKind::BalanceSum { expected, observed } => {
                write!(f, "balance sum expected {}, observed {}", expected, observed)
            }
            ViolationKind::RowCount { expected, observed } => {
                write!(f, "row count expected {}, observed {}", expected, observed)
            }
            ViolationKind::SequenceGap { previous, current } => write!(
                f,
                "missing sequence change: previous {}, current {}",
                previous, current
            ),
        }
    }
}
