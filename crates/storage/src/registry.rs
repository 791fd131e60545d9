//! Store registry: turns DSN strings into open stores
//!
//! Supported forms:
//! - `memory:<name>`: a process-wide named in-memory store; opening the
//!   same name twice yields the same tables
//! - `sqlite:<path>`: a SQLite database file
//! - anything else: treated as a SQLite file path
//!
//! ## Usage
//!
//! ```rust,ignore
//! let up = registry::open("memory:loop", &OpenOptions::default())?;
//! let down = registry::open("memory:loop", &OpenOptions::default())?;
//! // `up` and `down` share state: a loopback "replica"
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use tally_core::{Error, Result};

use crate::memory::{MemoryStore, DEFAULT_LOCK_WAIT_TIMEOUT};
use crate::sqlite::{SqliteStore, DEFAULT_POOL_SIZE};
use crate::traits::Store;

static MEMORY_STORES: Lazy<DashMap<String, MemoryStore>> = Lazy::new(DashMap::new);

/// Parsed data source name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dsn {
    /// Named in-memory store
    Memory(String),
    /// SQLite database file
    Sqlite(PathBuf),
}

impl FromStr for Dsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("empty DSN".into()));
        }
        if let Some(name) = s.strip_prefix("memory:") {
            if name.is_empty() {
                return Err(Error::Config(format!("memory DSN needs a name: {}", s)));
            }
            return Ok(Dsn::Memory(name.to_string()));
        }
        let path = s.strip_prefix("sqlite:").unwrap_or(s);
        if path.is_empty() {
            return Err(Error::Config(format!("sqlite DSN needs a path: {}", s)));
        }
        Ok(Dsn::Sqlite(PathBuf::from(path)))
    }
}

/// Backend tuning applied when a store is first opened
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// SQLite pool size
    pub pool_size: u32,
    /// Row lock wait bound for in-memory stores
    pub lock_wait_timeout: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            lock_wait_timeout: DEFAULT_LOCK_WAIT_TIMEOUT,
        }
    }
}

/// Get or create the named in-memory store
pub fn memory_store(name: &str, lock_wait_timeout: Duration) -> MemoryStore {
    MEMORY_STORES
        .entry(name.to_string())
        .or_insert_with(|| {
            MemoryStore::with_lock_wait_timeout(format!("memory:{}", name), lock_wait_timeout)
        })
        .clone()
}

/// Forget a named in-memory store; existing handles keep working
pub fn forget_memory_store(name: &str) -> bool {
    MEMORY_STORES.remove(name).is_some()
}

/// Open the store a DSN points to
pub fn open(dsn: &str, options: &OpenOptions) -> Result<Arc<dyn Store>> {
    match dsn.parse::<Dsn>()? {
        Dsn::Memory(name) => Ok(Arc::new(memory_store(&name, options.lock_wait_timeout))),
        Dsn::Sqlite(path) => Ok(Arc::new(SqliteStore::open(path, options.pool_size)?)),
    }
}
