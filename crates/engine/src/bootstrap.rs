//! Dataset bootstrapper
//!
//! Brings a scenario's table to a known-good state before the workload
//! starts. Existing data that still verifies is reused, so restarting a run
//! against a half-built or previously used store is safe: seed inserts are
//! insert-if-absent and a failed check drops the table first.
//!
//! Rows are loaded in fixed-size batches by a small worker pool. Every
//! batch goes through the retry executor; the first batch that fails for
//! good stops the remaining workers and fails the whole bootstrap.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use parking_lot::Mutex;
use tally_core::{Context, Error, HarnessConfig, Result, ShardId, Statement, TableName};
use tally_storage::Store;
use tracing::{debug, info, warn};

use crate::retry::{self, RetryPolicy};
use crate::scenario::Scenario;

/// Sizing and retry settings for dataset setup
#[derive(Debug, Clone)]
pub struct SetupOptions {
    /// Rows per table
    pub accounts: usize,
    /// Bulk-insert workers
    pub concurrency: usize,
    /// Rows per insert
    pub batch_size: usize,
    /// Retry policy for DDL, inserts and probes
    pub retry: RetryPolicy,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            accounts: 1000,
            concurrency: 10,
            batch_size: tally_core::DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl SetupOptions {
    /// Setup options taken from a harness configuration
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            accounts: config.accounts,
            concurrency: config.concurrency,
            batch_size: config.batch_size,
            retry: RetryPolicy::new()
                .with_max_attempts(config.retry_attempts)
                .with_backoff(config.retry_backoff()),
        }
    }
}

/// What bootstrap did to a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Existing data verified and was kept
    Reused,
    /// The table was (re)created and loaded
    Rebuilt {
        /// Number of insert batches issued
        batches: usize,
    },
}

/// One bulk insert: rows `offset..offset + size`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    /// First row id
    pub offset: usize,
    /// Row count
    pub size: usize,
}

/// Split `accounts` rows into batches of at most `batch_size`
///
/// The last batch carries the remainder, so sizes always add up to
/// `accounts` and no id is covered twice.
pub fn plan_batches(accounts: usize, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let count = (accounts + batch_size - 1) / batch_size;
    (0..count)
        .map(|i| {
            let offset = i * batch_size;
            Batch {
                offset,
                size: batch_size.min(accounts - offset),
            }
        })
        .collect()
}

/// Drop `table` through the retry executor
pub fn drop_table(
    store: &dyn Store,
    ctx: &Context,
    table: &TableName,
    policy: &RetryPolicy,
) -> Result<()> {
    let stmt = Statement::DropTable(table.clone());
    retry::run(ctx, policy, &format!("drop {}", table), || {
        store.exec(ctx, &stmt)
    })?;
    Ok(())
}

/// Drop the scenario's table if forced, missing, or failing verification
///
/// Returns whether the table was dropped (a missing table counts as dropped).
pub fn cleanup<S: Scenario + ?Sized>(
    store: &dyn Store,
    ctx: &Context,
    scenario: &S,
    shard: ShardId,
    setup: &SetupOptions,
    force: bool,
) -> Result<bool> {
    let table = scenario.table(shard);
    if !force {
        let exists = retry::run(ctx, &setup.retry, &format!("probe {}", table), || {
            store.table_exists(ctx, &table)
        })?;
        if exists {
            match scenario.verify(store, ctx, setup.accounts, shard, "cleanup") {
                Ok(()) => return Ok(false),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(
                        shard = shard.0,
                        scenario = scenario.name(),
                        store = store.name(),
                        error = %e,
                        "existing data failed verification, dropping"
                    );
                }
            }
        }
    }
    drop_table(store, ctx, &table, &setup.retry)?;
    debug!(shard = shard.0, table = %table, store = store.name(), force, "table dropped");
    Ok(true)
}

/// Create and load the scenario's table unless valid data is already there
pub fn bootstrap<S: Scenario + ?Sized>(
    store: &dyn Store,
    ctx: &Context,
    scenario: &S,
    shard: ShardId,
    setup: &SetupOptions,
) -> Result<BootstrapOutcome> {
    if !cleanup(store, ctx, scenario, shard, setup, false)? {
        info!(
            shard = shard.0,
            scenario = scenario.name(),
            store = store.name(),
            "existing data verified, reusing"
        );
        return Ok(BootstrapOutcome::Reused);
    }

    let table = scenario.table(shard);
    let create = scenario.create_table(shard);
    retry::run(ctx, &setup.retry, &format!("create {}", table), || {
        store.exec(ctx, &create)
    })?;

    let plan = plan_batches(setup.accounts, setup.batch_size);
    load(store, ctx, scenario, shard, setup, &plan)?;

    info!(
        shard = shard.0,
        scenario = scenario.name(),
        store = store.name(),
        rows = setup.accounts,
        batches = plan.len(),
        "bootstrap complete"
    );
    Ok(BootstrapOutcome::Rebuilt {
        batches: plan.len(),
    })
}

fn load<S: Scenario + ?Sized>(
    store: &dyn Store,
    ctx: &Context,
    scenario: &S,
    shard: ShardId,
    setup: &SetupOptions,
    plan: &[Batch],
) -> Result<()> {
    if plan.is_empty() {
        return Ok(());
    }

    // capacity covers the whole plan so the producer never blocks
    let (sender, receiver) = mpsc::sync_channel(plan.len());
    for batch in plan {
        sender
            .send(*batch)
            .map_err(|_| Error::Store("batch queue closed".to_string()))?;
    }
    drop(sender);

    let queue = Mutex::new(receiver);
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<Error>> = Mutex::new(None);
    let acknowledged = AtomicUsize::new(0);
    let workers = setup.concurrency.clamp(1, plan.len());

    thread::scope(|scope| -> Result<()> {
        for worker in 0..workers {
            let worker_loop = || loop {
                if failed.load(Ordering::Acquire) || ctx.token().is_cancelled() {
                    break;
                }
                let batch = match queue.lock().recv() {
                    Ok(batch) => batch,
                    Err(_) => break,
                };
                let stmt = scenario.seed_batch(shard, batch.offset, batch.size);
                let label = format!(
                    "insert {}[{}..{}]",
                    stmt.table(),
                    batch.offset,
                    batch.offset + batch.size
                );
                match retry::run(ctx, &setup.retry, &label, || store.exec(ctx, &stmt)) {
                    Ok(_) => {
                        acknowledged.fetch_add(1, Ordering::AcqRel);
                        debug!(
                            shard = shard.0,
                            offset = batch.offset,
                            size = batch.size,
                            "batch loaded"
                        );
                    }
                    Err(e) if e.is_cancellation() => break,
                    Err(e) => {
                        failed.store(true, Ordering::Release);
                        first_error.lock().get_or_insert(e);
                        break;
                    }
                }
            };
            thread::Builder::new()
                .name(format!("tally-load-{}-{}", shard, worker))
                .spawn_scoped(scope, worker_loop)?;
        }
        Ok(())
    })?;

    if let Some(e) = first_error.into_inner() {
        return Err(e);
    }
    if acknowledged.load(Ordering::Acquire) < plan.len() {
        return Err(Error::Cancelled);
    }
    Ok(())
}
