//! Store and transaction abstraction
//!
//! These traits are the only way the engine talks to a database. Any backend
//! that can run the typed [`Statement`]s and [`Query`]s atomically, with
//! row-locking reads inside a transaction, can stand behind them.
//!
//! Thread safety: a `Store` is shared by every task of a run and must be
//! `Send + Sync`. A `Transaction` is owned by a single task at a time.

use tally_core::{Context, Query, Result, Rows, Statement, TableName};

/// A pooled connection to one database
pub trait Store: Send + Sync {
    /// Human-readable name, used as the tag in logs and violations
    fn name(&self) -> &str;

    /// Run a read outside any explicit transaction
    ///
    /// # Errors
    ///
    /// Returns [`tally_core::Error::TableNotFound`] if the table is missing,
    /// a transient error on connection trouble.
    fn query(&self, ctx: &Context, query: &Query) -> Result<Rows>;

    /// Run a statement in its own transaction
    ///
    /// Returns the number of affected rows.
    fn exec(&self, ctx: &Context, stmt: &Statement) -> Result<u64>;

    /// Open a transaction
    fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>>;

    /// Whether `table` exists
    fn table_exists(&self, ctx: &Context, table: &TableName) -> Result<bool> {
        Ok(!self.query(ctx, &Query::TableExists(table.clone()))?.is_empty())
    }
}

/// An open transaction
///
/// Reads issued with `for_update` hold their row locks until the transaction
/// ends, and so do the rows touched by writes. Dropping a transaction that
/// was neither committed nor rolled back rolls it back.
pub trait Transaction: Send {
    /// Read inside the transaction; sees the transaction's own writes
    fn query(&mut self, ctx: &Context, query: &Query) -> Result<Rows>;

    /// Write inside the transaction; DDL is rejected
    fn exec(&mut self, ctx: &Context, stmt: &Statement) -> Result<u64>;

    /// Make every write visible at once, or none of them
    fn commit(self: Box<Self>, ctx: &Context) -> Result<()>;

    /// Discard every write and release locks
    fn rollback(self: Box<Self>) -> Result<()>;
}
