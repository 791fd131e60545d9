//! Harness configuration via a `tally.toml` file
//!
//! Every field has a default, so an empty file is valid. Command-line flags
//! override whatever the file says.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file name.
pub const CONFIG_FILE_NAME: &str = "tally.toml";

/// Rows per bulk insert statement.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Starting balance of every ledger account.
pub const DEFAULT_INITIAL_BALANCE: i64 = 1000;

/// Harness configuration loaded from `tally.toml`.
///
/// # Example
///
/// ```toml
/// upstream = "sqlite:/var/tmp/up.db"
/// downstream = "sqlite:/var/tmp/down.db"
/// accounts = 1000
/// tables = 4
/// rounds = 20
/// verify_interval_ms = 2000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    /// DSN of the store the workload writes to
    pub upstream: String,
    /// DSN of the replica
    pub downstream: String,
    /// Rows per table
    pub accounts: usize,
    /// Number of shards
    pub tables: u32,
    /// Bulk-insert workers during bootstrap
    pub concurrency: usize,
    /// Rows per bulk insert
    pub batch_size: usize,
    /// Starting balance per account
    pub initial_balance: i64,
    /// Delay between verify passes
    pub verify_interval_ms: u64,
    /// Verify passes before stopping (0 = run until cancelled)
    pub rounds: u64,
    /// Only drop tables and exit
    pub cleanup_only: bool,
    /// Bound on one workload transaction
    pub workload_timeout_ms: u64,
    /// Pause after a failed workload transaction (0 = retry at once)
    pub workload_pause_ms: u64,
    /// Bound on one verify call
    pub verify_timeout_ms: u64,
    /// How long to wait for the barrier downstream
    pub barrier_timeout_ms: u64,
    /// Barrier poll period
    pub barrier_poll_interval_ms: u64,
    /// Attempts for setup operations
    pub retry_attempts: u32,
    /// Fixed backoff between setup attempts
    pub retry_backoff_ms: u64,
    /// Row lock wait bound for the in-memory engine
    pub lock_wait_timeout_ms: u64,
    /// Seed for workload randomness; random when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            upstream: String::new(),
            downstream: String::new(),
            accounts: 1000,
            tables: 1,
            concurrency: 10,
            batch_size: DEFAULT_BATCH_SIZE,
            initial_balance: DEFAULT_INITIAL_BALANCE,
            verify_interval_ms: 2000,
            rounds: 10,
            cleanup_only: false,
            workload_timeout_ms: 10_000,
            workload_pause_ms: 0,
            verify_timeout_ms: 10_000,
            barrier_timeout_ms: 120_000,
            barrier_poll_interval_ms: 1000,
            retry_attempts: 5,
            retry_backoff_ms: 100,
            lock_wait_timeout_ms: 1000,
            seed: None,
        }
    }
}

impl HarnessConfig {
    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Parse config from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the harness cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.trim().is_empty() {
            return Err(Error::Config("upstream DSN is required".into()));
        }
        if self.downstream.trim().is_empty() {
            return Err(Error::Config("downstream DSN is required".into()));
        }
        if self.accounts < 2 {
            return Err(Error::Config(format!(
                "accounts must be at least 2, got {}",
                self.accounts
            )));
        }
        if self.tables == 0 {
            return Err(Error::Config("tables must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.retry_attempts == 0 {
            return Err(Error::Config("retry_attempts must be at least 1".into()));
        }
        if self.initial_balance < 0 {
            return Err(Error::Config("initial_balance must not be negative".into()));
        }
        Ok(())
    }

    /// Delay between verify passes.
    pub fn verify_interval(&self) -> Duration {
        Duration::from_millis(self.verify_interval_ms)
    }

    /// Bound on one workload transaction.
    pub fn workload_timeout(&self) -> Duration {
        Duration::from_millis(self.workload_timeout_ms)
    }

    /// Pause after a failed workload transaction.
    pub fn workload_pause(&self) -> Duration {
        Duration::from_millis(self.workload_pause_ms)
    }

    /// Bound on one verify call.
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    /// How long to wait for the barrier downstream.
    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    /// Barrier poll period.
    pub fn barrier_poll_interval(&self) -> Duration {
        Duration::from_millis(self.barrier_poll_interval_ms)
    }

    /// Backoff between setup attempts.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Row lock wait bound.
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }
}
