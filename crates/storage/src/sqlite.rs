//! SQLite-backed store
//!
//! Connections come from an `r2d2` pool. Every connection runs in WAL mode
//! with a busy timeout, and every transaction starts with `BEGIN IMMEDIATE`.
//! SQLite has no `SELECT ... FOR UPDATE`; taking the reserved lock up front
//! serialises writers, which is strictly stronger than the row locks the
//! workload asks for, so locking reads are issued as plain reads.
//!
//! The `marker` column is stamped with the transaction's start time in
//! microseconds since the Unix epoch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use tracing::{debug, warn};

use tally_core::{Context, Error, Query, Result, Rows, Statement};

use crate::traits::{Store, Transaction};

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: u32 = 16;

/// Busy timeout used when the caller has no deadline.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Conn = PooledConnection<SqliteConnectionManager>;

/// Classify a SQLite failure into the harness taxonomy
pub fn map_sqlite_error(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::CannotOpen
            | ErrorCode::OperationInterrupted => Error::Transient(err.to_string()),
            _ => match message
                .as_deref()
                .and_then(|m| m.strip_prefix("no such table: "))
            {
                Some(table) => Error::TableNotFound(table.to_string()),
                None => Error::Store(err.to_string()),
            },
        },
        _ => Error::Store(err.to_string()),
    }
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

fn busy_timeout_for(ctx: &Context) -> Duration {
    match ctx.remaining() {
        Some(left) => left.min(DEFAULT_BUSY_TIMEOUT),
        None => DEFAULT_BUSY_TIMEOUT,
    }
}

fn run_query(conn: &Connection, query: &Query) -> Result<Rows> {
    let sql = query.sql();
    let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
    let columns = stmt.column_count();
    let rows = stmt
        .query_map([], |row| {
            (0..columns)
                .map(|i| row.get::<_, i64>(i))
                .collect::<rusqlite::Result<Vec<i64>>>()
        })
        .map_err(map_sqlite_error)?
        .collect::<rusqlite::Result<Vec<Vec<i64>>>>()
        .map_err(map_sqlite_error)?;
    Ok(Rows::new(rows))
}

fn run_statement(conn: &Connection, stmt: &Statement, marker: i64) -> Result<u64> {
    let sql = stmt.sql();
    let params: Vec<i64> = if stmt.binds_marker() {
        vec![marker]
    } else {
        Vec::new()
    };
    let affected = conn
        .execute(&sql, params_from_iter(params))
        .map_err(map_sqlite_error)?;
    Ok(affected as u64)
}

/// Store backed by a SQLite database file
pub struct SqliteStore {
    name: String,
    path: PathBuf,
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    ///
    /// Fails if the first connection cannot be established.
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)
        });
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .map_err(|e| Error::Transient(format!("open {}: {}", path.display(), e)))?;

        debug!(path = %path.display(), pool_size, "sqlite store opened");
        Ok(Self {
            name: format!("sqlite:{}", path.display()),
            path,
            pool,
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self, ctx: &Context) -> Result<Conn> {
        ctx.check()?;
        let conn = self
            .pool
            .get_timeout(busy_timeout_for(ctx).max(Duration::from_millis(1)))
            .map_err(|e| Error::Transient(format!("{}: {}", self.name, e)))?;
        conn.busy_timeout(busy_timeout_for(ctx))
            .map_err(map_sqlite_error)?;
        Ok(conn)
    }
}

impl Store for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn query(&self, ctx: &Context, query: &Query) -> Result<Rows> {
        let conn = self.conn(ctx)?;
        run_query(&conn, query)
    }

    fn exec(&self, ctx: &Context, stmt: &Statement) -> Result<u64> {
        let conn = self.conn(ctx)?;
        run_statement(&conn, stmt, now_micros())
    }

    fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>> {
        let conn = self.conn(ctx)?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(map_sqlite_error)?;
        Ok(Box::new(SqliteTransaction {
            conn,
            marker: now_micros(),
            finished: false,
        }))
    }
}

struct SqliteTransaction {
    conn: Conn,
    marker: i64,
    finished: bool,
}

impl SqliteTransaction {
    fn ensure_open(&self, ctx: &Context) -> Result<()> {
        if self.finished {
            return Err(Error::Store("transaction already finished".into()));
        }
        ctx.check()
    }
}

impl Transaction for SqliteTransaction {
    fn query(&mut self, ctx: &Context, query: &Query) -> Result<Rows> {
        self.ensure_open(ctx)?;
        run_query(&self.conn, query)
    }

    fn exec(&mut self, ctx: &Context, stmt: &Statement) -> Result<u64> {
        self.ensure_open(ctx)?;
        if stmt.is_ddl() {
            return Err(Error::Store(format!(
                "schema changes are not allowed inside a transaction: {}",
                stmt
            )));
        }
        run_statement(&self.conn, stmt, self.marker)
    }

    fn commit(mut self: Box<Self>, ctx: &Context) -> Result<()> {
        self.ensure_open(ctx)?;
        self.finished = true;
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(map_sqlite_error(e));
        }
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(map_sqlite_error)
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!(error = %e, "rollback of abandoned sqlite transaction failed");
        }
    }
}
