//! Core types for tally
//!
//! This crate defines the foundational types shared by the storage and
//! engine layers:
//! - Error: the failure taxonomy (transient, violation, setup, cancellation)
//! - CancelToken / Context: cooperative cancellation with deadlines
//! - Statement / Query / Rows: the typed store surface
//! - HarnessConfig: run configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod stmt;

pub use cancel::{CancelToken, Context};
pub use config::{HarnessConfig, CONFIG_FILE_NAME, DEFAULT_BATCH_SIZE, DEFAULT_INITIAL_BALANCE};
pub use error::{Error, Result, Violation, ViolationKind};
pub use stmt::{
    LedgerRow, Query, Rows, SequenceRow, ShardId, Statement, TableKind, TableName, BARRIER_TABLE,
};
