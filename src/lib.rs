//! tally - consistency harness for data-replication pipelines
//!
//! Drives invariant-preserving transactional workloads against an upstream
//! store and keeps checking that both the upstream and a downstream replica
//! still satisfy those invariants.
//!
//! # Quick Start
//!
//! ```ignore
//! use tally::{CancelToken, Harness, HarnessConfig};
//!
//! let config = HarnessConfig {
//!     upstream: "memory:up".into(),
//!     downstream: "memory:up".into(),
//!     rounds: 3,
//!     ..Default::default()
//! };
//! let report = Harness::open(config)?.run(&CancelToken::new())?;
//! ```
//!
//! # Architecture
//!
//! - `tally-core`: errors, cancellation, typed statements, config
//! - `tally-storage`: the `Store` adapter and its memory and SQLite backends
//! - `tally-engine`: retry, bootstrap, scenarios, barrier, run driver

pub mod cli;
pub mod logging;

pub use tally_core::{CancelToken, Context, Error, HarnessConfig, Result, ShardId, Violation};
pub use tally_engine::{
    default_scenarios, Harness, Outcome, Phase, RunReport, Scenario, ScenarioKind,
};
pub use tally_storage::{open, Dsn, MemoryStore, OpenOptions, SqliteStore, Store, Transaction};
