//! Typed statements and result rows
//!
//! The harness never builds SQL strings by hand. Scenarios describe what they
//! want as a [`Statement`] or [`Query`]; SQL backends render it with
//! [`Statement::sql`] / [`Query::sql`], the in-memory engine interprets it
//! directly. `Display` renders the same SQL, with the row-locking clause, for
//! log output.
//!
//! Every write statement stamps the `marker` column of the rows it touches with
//! a backend-chosen transaction identifier, bound as parameter `?1`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one independent table pair
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which schema a table follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// `(id, balance, marker)`
    Ledger,
    /// `(id, counter, sequence, marker)`
    Sequence,
    /// `(foo)`, never holds rows
    Barrier,
}

impl TableKind {
    /// Non-key columns, in storage order
    pub fn value_columns(&self) -> &'static [&'static str] {
        match self {
            TableKind::Ledger => &["balance", "marker"],
            TableKind::Sequence => &["counter", "sequence", "marker"],
            TableKind::Barrier => &[],
        }
    }
}

/// Fully qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    kind: TableKind,
    shard: Option<ShardId>,
}

/// Name of the sync barrier table
pub const BARRIER_TABLE: &str = "finishmark";

impl TableName {
    /// `ledger{shard}`
    pub fn ledger(shard: ShardId) -> Self {
        Self {
            kind: TableKind::Ledger,
            shard: Some(shard),
        }
    }

    /// `sequence{shard}`
    pub fn sequence(shard: ShardId) -> Self {
        Self {
            kind: TableKind::Sequence,
            shard: Some(shard),
        }
    }

    /// The barrier table
    pub fn barrier() -> Self {
        Self {
            kind: TableKind::Barrier,
            shard: None,
        }
    }

    /// Schema of this table
    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Owning shard, `None` for the barrier
    pub fn shard(&self) -> Option<ShardId> {
        self.shard
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.shard) {
            (TableKind::Ledger, Some(s)) => write!(f, "ledger{}", s),
            (TableKind::Sequence, Some(s)) => write!(f, "sequence{}", s),
            _ => f.write_str(BARRIER_TABLE),
        }
    }
}

/// Seed row of a ledger table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerRow {
    /// Account id
    pub id: i64,
    /// Starting balance
    pub balance: i64,
}

/// Seed row of a sequence table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRow {
    /// Row id, 0 is the cursor
    pub id: i64,
    /// Starting counter
    pub counter: i64,
    /// Starting sequence
    pub sequence: i64,
}

/// A write or DDL statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `CREATE TABLE IF NOT EXISTS`
    CreateTable(TableName),
    /// `DROP TABLE IF EXISTS`
    DropTable(TableName),
    /// Multi-row insert that skips ids already present
    InsertLedger {
        /// Target table
        table: TableName,
        /// Rows to insert
        rows: Vec<LedgerRow>,
    },
    /// Multi-row insert that skips ids already present
    InsertSequence {
        /// Target table
        table: TableName,
        /// Rows to insert
        rows: Vec<SequenceRow>,
    },
    /// Set one account's balance
    UpdateBalance {
        /// Target table
        table: TableName,
        /// Account id
        id: i64,
        /// New balance
        balance: i64,
    },
    /// Set counter and sequence on a set of rows
    UpdateSequence {
        /// Target table
        table: TableName,
        /// Rows to update
        ids: Vec<i64>,
        /// New counter
        counter: i64,
        /// New sequence
        sequence: i64,
    },
}

impl Statement {
    /// Table the statement touches
    pub fn table(&self) -> &TableName {
        match self {
            Statement::CreateTable(t) | Statement::DropTable(t) => t,
            Statement::InsertLedger { table, .. }
            | Statement::InsertSequence { table, .. }
            | Statement::UpdateBalance { table, .. }
            | Statement::UpdateSequence { table, .. } => table,
        }
    }

    /// Whether this is a schema change
    pub fn is_ddl(&self) -> bool {
        matches!(self, Statement::CreateTable(_) | Statement::DropTable(_))
    }

    /// Whether the SQL rendering binds the transaction marker as `?1`
    pub fn binds_marker(&self) -> bool {
        matches!(
            self,
            Statement::UpdateBalance { .. } | Statement::UpdateSequence { .. }
        )
    }

    /// SQL text of this statement
    pub fn sql(&self) -> String {
        match self {
            Statement::CreateTable(table) => {
                let columns = match table.kind() {
                    TableKind::Ledger => {
                        "id BIGINT PRIMARY KEY, balance BIGINT NOT NULL, marker BIGINT NOT NULL"
                    }
                    TableKind::Sequence => {
                        "id BIGINT PRIMARY KEY, counter BIGINT NOT NULL, \
                         sequence BIGINT NOT NULL, marker BIGINT NOT NULL"
                    }
                    TableKind::Barrier => "foo BIGINT PRIMARY KEY",
                };
                format!("CREATE TABLE IF NOT EXISTS {} ({})", table, columns)
            }
            Statement::DropTable(table) => format!("DROP TABLE IF EXISTS {}", table),
            Statement::InsertLedger { table, rows } => {
                let values: Vec<String> = rows
                    .iter()
                    .map(|r| format!("({}, {}, 0)", r.id, r.balance))
                    .collect();
                format!(
                    "INSERT OR IGNORE INTO {} (id, balance, marker) VALUES {}",
                    table,
                    values.join(",")
                )
            }
            Statement::InsertSequence { table, rows } => {
                let values: Vec<String> = rows
                    .iter()
                    .map(|r| format!("({}, {}, {}, 0)", r.id, r.counter, r.sequence))
                    .collect();
                format!(
                    "INSERT OR IGNORE INTO {} (id, counter, sequence, marker) VALUES {}",
                    table,
                    values.join(",")
                )
            }
            Statement::UpdateBalance { table, id, balance } => format!(
                "UPDATE {} SET balance = {}, marker = ?1 WHERE id = {}",
                table, balance, id
            ),
            Statement::UpdateSequence {
                table,
                ids,
                counter,
                sequence,
            } => {
                let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                format!(
                    "UPDATE {} SET counter = {}, sequence = {}, marker = ?1 WHERE id IN ({})",
                    table,
                    counter,
                    sequence,
                    ids.join(", ")
                )
            }
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}

/// A read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// One row when the table exists, none otherwise
    TableExists(TableName),
    /// `balance` of one account
    Balance {
        /// Ledger table
        table: TableName,
        /// Account id
        id: i64,
        /// Hold a row lock until the transaction ends
        for_update: bool,
    },
    /// `(counter, sequence)` of one row
    Cursor {
        /// Sequence table
        table: TableName,
        /// Row id
        id: i64,
        /// Hold a row lock until the transaction ends
        for_update: bool,
    },
    /// `SUM(balance)`, zero on an empty table
    SumBalance(TableName),
    /// `COUNT(*)`
    CountRows(TableName),
    /// Every `sequence` value in ascending order
    Sequences(TableName),
}

impl Query {
    /// Table the query reads
    pub fn table(&self) -> &TableName {
        match self {
            Query::TableExists(t)
            | Query::SumBalance(t)
            | Query::CountRows(t)
            | Query::Sequences(t) => t,
            Query::Balance { table, .. } | Query::Cursor { table, .. } => table,
        }
    }

    /// Whether the query asks for row locks
    pub fn for_update(&self) -> bool {
        matches!(
            self,
            Query::Balance {
                for_update: true,
                ..
            } | Query::Cursor {
                for_update: true,
                ..
            }
        )
    }

    /// SQL text without the row-locking clause
    pub fn sql(&self) -> String {
        match self {
            Query::TableExists(table) => format!(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = '{}'",
                table
            ),
            Query::Balance { table, id, .. } => {
                format!("SELECT balance FROM {} WHERE id = {}", table, id)
            }
            Query::Cursor { table, id, .. } => {
                format!("SELECT counter, sequence FROM {} WHERE id = {}", table, id)
            }
            Query::SumBalance(table) => {
                format!("SELECT COALESCE(SUM(balance), 0) FROM {}", table)
            }
            Query::CountRows(table) => format!("SELECT COUNT(*) FROM {}", table),
            Query::Sequences(table) => {
                format!("SELECT sequence FROM {} ORDER BY sequence", table)
            }
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())?;
        if self.for_update() {
            f.write_str(" FOR UPDATE")?;
        }
        Ok(())
    }
}

/// Integer result rows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rows {
    rows: Vec<Vec<i64>>,
}

impl Rows {
    /// Wrap already-materialised rows
    pub fn new(rows: Vec<Vec<i64>>) -> Self {
        Self { rows }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the result is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First row, if any
    pub fn first(&self) -> Option<&[i64]> {
        self.rows.first().map(|r| r.as_slice())
    }

    /// Iterate rows
    pub fn iter(&self) -> impl Iterator<Item = &[i64]> {
        self.rows.iter().map(|r| r.as_slice())
    }

    /// First column of the first row
    pub fn scalar(&self) -> Result<i64> {
        self.first()
            .and_then(|r| r.first().copied())
            .ok_or_else(|| Error::Store("query returned no rows".to_string()))
    }

    /// The `idx`-th column of every row
    pub fn column(&self, idx: usize) -> Vec<i64> {
        self.rows.iter().filter_map(|r| r.get(idx).copied()).collect()
    }
}
