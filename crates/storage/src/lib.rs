//! Storage layer for tally
//!
//! This crate implements the transactional store adapter:
//! - Store / Transaction: the traits the engine is written against
//! - MemoryStore: in-process tables with row locks and fault injection
//! - SqliteStore: pooled SQLite connections (`rusqlite` + `r2d2`)
//! - registry: DSN parsing and named in-memory stores

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod registry;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStore;
pub use registry::{open, Dsn, OpenOptions};
pub use sqlite::SqliteStore;
pub use traits::{Store, Transaction};
