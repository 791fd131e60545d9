//! MemoryStore: in-process transactional tables
//!
//! This module implements the `Store` trait using:
//! - `BTreeMap<i64, Vec<i64>>` per table, keyed by row id
//! - a row-lock table mapping `(table, id)` to the owning transaction
//! - `parking_lot::Mutex` + `Condvar` so lock waiters wake on release
//! - `AtomicU64` commit versions, stamped into the `marker` column
//!
//! # Design Notes
//!
//! - **Buffered writes**: a transaction's statements are queued and applied in
//!   one critical section at commit, so readers never see a partial commit
//! - **Pessimistic locking**: `for_update` reads and every write lock their
//!   rows; waiting is bounded by the lock wait timeout and the caller's context
//! - **Read committed**: reads outside the transaction's own rows see the
//!   latest committed state
//! - **Fault injection**: `inject_failures(n)` makes the next `n` operations
//!   fail with a transient error

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use tally_core::{Context, Error, Query, Result, Rows, Statement, TableKind, TableName};

use crate::traits::{Store, Transaction};

/// Default bound on a single row lock wait.
pub const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest uninterrupted park while waiting for a row lock.
const LOCK_POLL: Duration = Duration::from_millis(10);

type RowKey = (String, i64);

#[derive(Debug, Clone)]
struct Table {
    kind: TableKind,
    rows: BTreeMap<i64, Vec<i64>>,
}

impl Table {
    fn new(kind: TableKind) -> Self {
        Self {
            kind,
            rows: BTreeMap::new(),
        }
    }

    fn expect_kind(&self, name: &str, kind: TableKind) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(Error::Store(format!(
                "table {} has schema {:?}, not {:?}",
                name, self.kind, kind
            )))
        }
    }

    fn apply(&mut self, name: &str, stmt: &Statement, marker: i64) -> Result<u64> {
        let mut affected = 0;
        match stmt {
            Statement::InsertLedger { rows, .. } => {
                self.expect_kind(name, TableKind::Ledger)?;
                for row in rows {
                    if !self.rows.contains_key(&row.id) {
                        self.rows.insert(row.id, vec![row.balance, 0]);
                        affected += 1;
                    }
                }
            }
            Statement::InsertSequence { rows, .. } => {
                self.expect_kind(name, TableKind::Sequence)?;
                for row in rows {
                    if !self.rows.contains_key(&row.id) {
                        self.rows
                            .insert(row.id, vec![row.counter, row.sequence, 0]);
                        affected += 1;
                    }
                }
            }
            Statement::UpdateBalance { id, balance, .. } => {
                self.expect_kind(name, TableKind::Ledger)?;
                if let Some(row) = self.rows.get_mut(id) {
                    row[0] = *balance;
                    row[1] = marker;
                    affected += 1;
                }
            }
            Statement::UpdateSequence {
                ids,
                counter,
                sequence,
                ..
            } => {
                self.expect_kind(name, TableKind::Sequence)?;
                for id in ids {
                    if let Some(row) = self.rows.get_mut(id) {
                        row[0] = *counter;
                        row[1] = *sequence;
                        row[2] = marker;
                        affected += 1;
                    }
                }
            }
            Statement::CreateTable(_) | Statement::DropTable(_) => {
                return Err(Error::Store(format!(
                    "schema change cannot be applied as a row write: {}",
                    stmt
                )))
            }
        }
        Ok(affected)
    }

    fn eval(&self, name: &str, query: &Query) -> Result<Rows> {
        let rows = match query {
            Query::TableExists(_) => vec![vec![1]],
            Query::Balance { id, .. } => {
                self.expect_kind(name, TableKind::Ledger)?;
                self.rows.get(id).map(|r| vec![r[0]]).into_iter().collect()
            }
            Query::Cursor { id, .. } => {
                self.expect_kind(name, TableKind::Sequence)?;
                self.rows
                    .get(id)
                    .map(|r| vec![r[0], r[1]])
                    .into_iter()
                    .collect()
            }
            Query::SumBalance(_) => {
                self.expect_kind(name, TableKind::Ledger)?;
                vec![vec![self.rows.values().map(|r| r[0]).sum()]]
            }
            Query::CountRows(_) => vec![vec![self.rows.len() as i64]],
            Query::Sequences(_) => {
                self.expect_kind(name, TableKind::Sequence)?;
                let mut values: Vec<i64> = self.rows.values().map(|r| r[1]).collect();
                values.sort_unstable();
                values.into_iter().map(|v| vec![v]).collect()
            }
        };
        Ok(Rows::new(rows))
    }
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    locks: HashMap<RowKey, u64>,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    released: Condvar,
    next_txn_id: AtomicU64,
    version: AtomicU64,
    lock_wait_timeout: Duration,
    pending_faults: AtomicU32,
}

impl Inner {
    fn admit(&self) -> Result<()> {
        let injected = self
            .pending_faults
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Transient(format!(
                "injected fault on store {}",
                self.name
            )));
        }
        Ok(())
    }

    fn release_locks(&self, state: &mut State, held: &mut Vec<RowKey>) {
        if held.is_empty() {
            return;
        }
        for key in held.drain(..) {
            state.locks.remove(&key);
        }
        self.released.notify_all();
    }
}

/// In-process transactional store
///
/// Cloning yields another handle to the same tables.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_lock_wait_timeout(name, DEFAULT_LOCK_WAIT_TIMEOUT)
    }

    /// Create an empty store with a custom row lock wait bound
    pub fn with_lock_wait_timeout(name: impl Into<String>, lock_wait_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                released: Condvar::new(),
                next_txn_id: AtomicU64::new(1),
                version: AtomicU64::new(0),
                lock_wait_timeout,
                pending_faults: AtomicU32::new(0),
            }),
        }
    }

    /// Make the next `count` operations fail with a transient error
    pub fn inject_failures(&self, count: u32) {
        self.inner.pending_faults.store(count, Ordering::Release);
    }

    /// Faults injected but not yet consumed
    pub fn pending_failures(&self) -> u32 {
        self.inner.pending_faults.load(Ordering::Acquire)
    }

    /// Number of committed transactions
    pub fn current_version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Copy of a table's rows as `[id, columns..]`, `None` if missing
    pub fn dump(&self, table: &TableName) -> Option<Vec<Vec<i64>>> {
        let state = self.inner.state.lock();
        state.tables.get(&table.to_string()).map(|t| {
            t.rows
                .iter()
                .map(|(id, cols)| {
                    let mut row = Vec::with_capacity(cols.len() + 1);
                    row.push(*id);
                    row.extend_from_slice(cols);
                    row
                })
                .collect()
        })
    }

    /// Names of all existing tables, sorted
    pub fn table_names(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut names: Vec<String> = state.tables.keys().cloned().collect();
        names.sort();
        names
    }

    fn exec_ddl(&self, stmt: &Statement) -> u64 {
        let name = stmt.table().to_string();
        let mut state = self.inner.state.lock();
        match stmt {
            Statement::CreateTable(table) => {
                state
                    .tables
                    .entry(name)
                    .or_insert_with(|| Table::new(table.kind()));
            }
            Statement::DropTable(_) => {
                state.tables.remove(&name);
            }
            _ => {}
        }
        0
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn query(&self, ctx: &Context, query: &Query) -> Result<Rows> {
        ctx.check()?;
        self.inner.admit()?;
        let name = query.table().to_string();
        let state = self.inner.state.lock();
        match (query, state.tables.get(&name)) {
            (Query::TableExists(_), None) => Ok(Rows::default()),
            (_, None) => Err(Error::TableNotFound(name)),
            (_, Some(table)) => table.eval(&name, query),
        }
    }

    fn exec(&self, ctx: &Context, stmt: &Statement) -> Result<u64> {
        ctx.check()?;
        if stmt.is_ddl() {
            self.inner.admit()?;
            return Ok(self.exec_ddl(stmt));
        }
        let mut txn = self.begin(ctx)?;
        let affected = txn.exec(ctx, stmt)?;
        txn.commit(ctx)?;
        Ok(affected)
    }

    fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>> {
        ctx.check()?;
        self.inner.admit()?;
        let id = self.inner.next_txn_id.fetch_add(1, Ordering::Relaxed);
        trace!(store = %self.inner.name, txn_id = id, "memory transaction started");
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            id,
            held: Vec::new(),
            pending: Vec::new(),
            finished: false,
        }))
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    id: u64,
    held: Vec<RowKey>,
    pending: Vec<Statement>,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(Error::Store(format!(
                "transaction {} already finished",
                self.id
            )));
        }
        Ok(())
    }

    fn lock_rows(&mut self, ctx: &Context, table: &str, ids: &[i64]) -> Result<()> {
        let started = Instant::now();
        let mut state = self.inner.state.lock();
        for &id in ids {
            let key = (table.to_string(), id);
            loop {
                match state.locks.get(&key) {
                    None => {
                        state.locks.insert(key.clone(), self.id);
                        self.held.push(key);
                        break;
                    }
                    Some(owner) if *owner == self.id => break,
                    Some(_) => {}
                }
                ctx.check()?;
                let now = Instant::now();
                let give_up = started + self.inner.lock_wait_timeout;
                if now >= give_up {
                    return Err(Error::LockWaitTimeout {
                        table: table.to_string(),
                        id,
                    });
                }
                let mut wake = give_up.min(now + LOCK_POLL);
                if let Some(deadline) = ctx.deadline() {
                    wake = wake.min(deadline);
                }
                self.inner.released.wait_until(&mut state, wake);
            }
        }
        Ok(())
    }

    fn row_ids(stmt: &Statement) -> Vec<i64> {
        match stmt {
            Statement::InsertLedger { rows, .. } => rows.iter().map(|r| r.id).collect(),
            Statement::InsertSequence { rows, .. } => rows.iter().map(|r| r.id).collect(),
            Statement::UpdateBalance { id, .. } => vec![*id],
            Statement::UpdateSequence { ids, .. } => ids.clone(),
            Statement::CreateTable(_) | Statement::DropTable(_) => Vec::new(),
        }
    }

    /// Committed table with this transaction's own writes laid over it
    fn overlay(&self, base: &Table, name: &str) -> Result<Table> {
        let mut view = base.clone();
        for stmt in self.pending.iter().filter(|s| s.table().to_string() == name) {
            view.apply(name, stmt, 0)?;
        }
        Ok(view)
    }
}

impl Transaction for MemoryTransaction {
    fn query(&mut self, ctx: &Context, query: &Query) -> Result<Rows> {
        self.ensure_open()?;
        ctx.check()?;
        self.inner.admit()?;
        let name = query.table().to_string();
        match query {
            Query::Balance {
                id,
                for_update: true,
                ..
            }
            | Query::Cursor {
                id,
                for_update: true,
                ..
            } => {
                self.lock_rows(ctx, &name, &[*id])?;
            }
            _ => {}
        }
        let state = self.inner.state.lock();
        let table = match (query, state.tables.get(&name)) {
            (Query::TableExists(_), None) => return Ok(Rows::default()),
            (_, None) => return Err(Error::TableNotFound(name)),
            (_, Some(table)) => table,
        };
        if self.pending.iter().any(|s| s.table().to_string() == name) {
            self.overlay(table, &name)?.eval(&name, query)
        } else {
            table.eval(&name, query)
        }
    }

    fn exec(&mut self, ctx: &Context, stmt: &Statement) -> Result<u64> {
        self.ensure_open()?;
        if stmt.is_ddl() {
            return Err(Error::Store(format!(
                "schema changes are not allowed inside a transaction: {}",
                stmt
            )));
        }
        ctx.check()?;
        self.inner.admit()?;
        let name = stmt.table().to_string();
        self.lock_rows(ctx, &name, &Self::row_ids(stmt))?;

        // Count against a view so the caller learns how many rows matched.
        let affected = {
            let state = self.inner.state.lock();
            let table = state
                .tables
                .get(&name)
                .ok_or_else(|| Error::TableNotFound(name.clone()))?;
            let mut view = self.overlay(table, &name)?;
            view.apply(&name, stmt, 0)?
        };
        self.pending.push(stmt.clone());
        Ok(affected)
    }

    fn commit(mut self: Box<Self>, ctx: &Context) -> Result<()> {
        self.ensure_open()?;
        let admitted = ctx.check().and_then(|_| self.inner.admit());
        let inner = Arc::clone(&self.inner);
        let mut state = inner.state.lock();
        self.finished = true;
        if let Err(e) = admitted {
            inner.release_locks(&mut state, &mut self.held);
            return Err(e);
        }

        // Validate everything before touching anything.
        for stmt in &self.pending {
            let name = stmt.table().to_string();
            if !state.tables.contains_key(&name) {
                inner.release_locks(&mut state, &mut self.held);
                return Err(Error::TableNotFound(name));
            }
        }
        let mut staged: HashMap<String, Table> = HashMap::new();
        for stmt in &self.pending {
            let name = stmt.table().to_string();
            if !staged.contains_key(&name) {
                staged.insert(name.clone(), state.tables[&name].clone());
            }
        }
        let marker = inner.version.load(Ordering::Acquire) as i64 + 1;
        for stmt in &self.pending {
            let name = stmt.table().to_string();
            if let Some(table) = staged.get_mut(&name) {
                if let Err(e) = table.apply(&name, stmt, marker) {
                    inner.release_locks(&mut state, &mut self.held);
                    return Err(e);
                }
            }
        }

        state.tables.extend(staged);
        inner.version.fetch_add(1, Ordering::AcqRel);
        inner.release_locks(&mut state, &mut self.held);
        trace!(store = %inner.name, txn_id = self.id, marker, "memory transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.ensure_open()?;
        self.finished = true;
        self.pending.clear();
        let inner = Arc::clone(&self.inner);
        let mut state = inner.state.lock();
        inner.release_locks(&mut state, &mut self.held);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let mut state = inner.state.lock();
        inner.release_locks(&mut state, &mut self.held);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tally_core::{CancelToken, LedgerRow, ShardId};

    fn ledger() -> TableName {
        TableName::ledger(ShardId(0))
    }

    fn seeded(accounts: i64) -> MemoryStore {
        let store = MemoryStore::new("test");
        let ctx = Context::background();
        store.exec(&ctx, &Statement::CreateTable(ledger())).unwrap();
        store
            .exec(
                &ctx,
                &Statement::InsertLedger {
                    table: ledger(),
                    rows: (0..accounts).map(|id| LedgerRow { id, balance: 100 }).collect(),
                },
            )
            .unwrap();
        store
    }

    fn balance(store: &MemoryStore, id: i64) -> i64 {
        store
            .query(
                &Context::background(),
                &Query::Balance {
                    table: ledger(),
                    id,
                    for_update: false,
                },
            )
            .unwrap()
            .scalar()
            .unwrap()
    }

    #[test]
    fn test_insert_ignores_existing_ids() {
        let store = seeded(3);
        let ctx = Context::background();
        let affected = store
            .exec(
                &ctx,
                &Statement::InsertLedger {
                    table: ledger(),
                    rows: (0..5).map(|id| LedgerRow { id, balance: 7 }).collect(),
                },
            )
            .unwrap();
        assert_eq!(affected, 2);
        assert_eq!(balance(&store, 0), 100);
        assert_eq!(balance(&store, 4), 7);
    }

    #[test]
    fn test_uncommitted_writes_invisible_outside() {
        let store = seeded(2);
        let ctx = Context::background();
        let mut txn = store.begin(&ctx).unwrap();
        txn.exec(
            &ctx,
            &Statement::UpdateBalance {
                table: ledger(),
                id: 0,
                balance: 1,
            },
        )
        .unwrap();

        // Own write visible inside, not outside.
        let inside = txn
            .query(
                &ctx,
                &Query::Balance {
                    table: ledger(),
                    id: 0,
                    for_update: false,
                },
            )
            .unwrap();
        assert_eq!(inside.scalar().unwrap(), 1);
        assert_eq!(balance(&store, 0), 100);

        txn.commit(&ctx).unwrap();
        assert_eq!(balance(&store, 0), 1);
    }

    #[test]
    fn test_drop_rolls_back_and_releases_locks() {
        let store = seeded(2);
        let ctx = Context::background();
        {
            let mut txn = store.begin(&ctx).unwrap();
            txn.exec(
                &ctx,
                &Statement::UpdateBalance {
                    table: ledger(),
                    id: 1,
                    balance: 0,
                },
            )
            .unwrap();
        }
        assert_eq!(balance(&store, 1), 100);

        let mut txn = store.begin(&ctx).unwrap();
        txn.query(
            &ctx,
            &Query::Balance {
                table: ledger(),
                id: 1,
                for_update: true,
            },
        )
        .unwrap();
        txn.rollback().unwrap();
    }

    #[test]
    fn test_marker_stamped_with_commit_version() {
        let store = seeded(1);
        let ctx = Context::background();
        store
            .exec(
                &ctx,
                &Statement::UpdateBalance {
                    table: ledger(),
                    id: 0,
                    balance: 50,
                },
            )
            .unwrap();
        let rows = store.dump(&ledger()).unwrap();
        assert_eq!(rows[0], vec![0, 50, store.current_version() as i64]);
    }

    #[test]
    fn test_lock_wait_times_out() {
        let store = MemoryStore::with_lock_wait_timeout("locks", Duration::from_millis(30));
        let ctx = Context::background();
        store.exec(&ctx, &Statement::CreateTable(ledger())).unwrap();
        store
            .exec(
                &ctx,
                &Statement::InsertLedger {
                    table: ledger(),
                    rows: vec![LedgerRow { id: 0, balance: 1 }],
                },
            )
            .unwrap();

        let lock = Query::Balance {
            table: ledger(),
            id: 0,
            for_update: true,
        };
        let mut holder = store.begin(&ctx).unwrap();
        holder.query(&ctx, &lock).unwrap();

        let mut waiter = store.begin(&ctx).unwrap();
        let err = waiter.query(&ctx, &lock).unwrap_err();
        assert!(matches!(err, Error::LockWaitTimeout { id: 0, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_lock_handed_over_on_commit() {
        let store = seeded(1);
        let ctx = Context::background();
        let lock = Query::Balance {
            table: ledger(),
            id: 0,
            for_update: true,
        };
        let mut holder = store.begin(&ctx).unwrap();
        holder.query(&ctx, &lock).unwrap();

        let store2 = store.clone();
        let waiter = thread::spawn(move || {
            let ctx = Context::background();
            let mut txn = store2.begin(&ctx).unwrap();
            let seen = txn.query(&ctx, &lock).unwrap().scalar().unwrap();
            txn.rollback().unwrap();
            seen
        });
        thread::sleep(Duration::from_millis(20));
        holder
            .exec(
                &ctx,
                &Statement::UpdateBalance {
                    table: ledger(),
                    id: 0,
                    balance: 42,
                },
            )
            .unwrap();
        holder.commit(&ctx).unwrap();
        assert_eq!(waiter.join().unwrap(), 42);
    }

    #[test]
    fn test_cancel_interrupts_lock_wait() {
        let store = MemoryStore::with_lock_wait_timeout("cancel", Duration::from_secs(30));
        let ctx = Context::background();
        store.exec(&ctx, &Statement::CreateTable(ledger())).unwrap();
        let lock = Query::Balance {
            table: ledger(),
            id: 0,
            for_update: true,
        };
        let mut holder = store.begin(&ctx).unwrap();
        holder.query(&ctx, &lock).unwrap();

        let token = CancelToken::new();
        let waiter_ctx = Context::new(token.clone());
        let store2 = store.clone();
        let waiter = thread::spawn(move || {
            let mut txn = store2.begin(&waiter_ctx).unwrap();
            txn.query(&waiter_ctx, &lock).map(|_| ())
        });
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_commit_to_dropped_table_applies_nothing() {
        let store = seeded(2);
        let ctx = Context::background();
        let mut txn = store.begin(&ctx).unwrap();
        txn.exec(
            &ctx,
            &Statement::UpdateBalance {
                table: ledger(),
                id: 0,
                balance: 0,
            },
        )
        .unwrap();
        store.exec(&ctx, &Statement::DropTable(ledger())).unwrap();
        assert!(matches!(txn.commit(&ctx), Err(Error::TableNotFound(_))));
        assert!(!store.table_exists(&ctx, &ledger()).unwrap());
    }

    #[test]
    fn test_injected_faults_are_transient_and_consumed() {
        let store = seeded(1);
        let ctx = Context::background();
        store.inject_failures(2);
        assert!(store.query(&ctx, &Query::CountRows(ledger())).unwrap_err().is_transient());
        assert!(store.query(&ctx, &Query::CountRows(ledger())).unwrap_err().is_transient());
        assert_eq!(store.pending_failures(), 0);
        assert_eq!(
            store.query(&ctx, &Query::CountRows(ledger())).unwrap().scalar().unwrap(),
            1
        );
    }

    #[test]
    fn test_missing_table_and_ddl_in_txn() {
        let store = MemoryStore::new("empty");
        let ctx = Context::background();
        assert!(!store.table_exists(&ctx, &ledger()).unwrap());
        assert!(matches!(
            store.query(&ctx, &Query::SumBalance(ledger())),
            Err(Error::TableNotFound(_))
        ));
        let mut txn = store.begin(&ctx).unwrap();
        assert!(txn.exec(&ctx, &Statement::CreateTable(ledger())).is_err());
    }
}
