//! Dataset bootstrap tests
//!
//! Batch layout, idempotence across restarts, rebuild of bad data, retry
//! behavior under injected faults and the SQLite backend.

use std::collections::BTreeSet;
use std::time::Duration;

use tally_core::{CancelToken, Context, Error, Query, ShardId, Statement, TableName};
use tally_engine::bootstrap::{self, BootstrapOutcome, SetupOptions};
use tally_engine::{Conservation, RetryPolicy, Scenario, Sequence};
use tally_storage::{MemoryStore, SqliteStore, Store};
use tempfile::TempDir;

fn setup(accounts: usize) -> SetupOptions {
    SetupOptions {
        accounts,
        concurrency: 4,
        batch_size: 100,
        retry: RetryPolicy::new()
            .with_max_attempts(5)
            .with_backoff(Duration::from_millis(1)),
    }
}

fn count(store: &dyn Store, table: TableName) -> i64 {
    store
        .query(&Context::background(), &Query::CountRows(table))
        .unwrap()
        .scalar()
        .unwrap()
}

// ============================================================================
// Layout
// ============================================================================

#[test]
fn test_odd_account_count_loads_every_row_once() {
    let store = MemoryStore::new("bootstrap-odd");
    let ctx = Context::background();
    let scenario = Conservation::new(1000);

    let outcome = scenario
        .prepare(&store, &ctx, ShardId(0), &setup(250))
        .unwrap();
    assert_eq!(outcome, BootstrapOutcome::Rebuilt { batches: 3 });

    let rows = store.dump(&TableName::ledger(ShardId(0))).unwrap();
    let ids: BTreeSet<i64> = rows.iter().map(|r| r[0]).collect();
    assert_eq!(rows.len(), 250);
    assert_eq!(ids, (0..250).collect());
    assert!(rows.iter().all(|r| r[1] == 1000));
}

#[test]
fn test_both_scenarios_prepare_per_shard() {
    let store = MemoryStore::new("bootstrap-shards");
    let ctx = Context::background();
    for shard in 0..3 {
        for scenario in tally_engine::default_scenarios(1000) {
            scenario
                .prepare(&store, &ctx, ShardId(shard), &setup(120))
                .unwrap();
        }
    }
    assert_eq!(store.table_names().len(), 6);
    assert_eq!(count(&store, TableName::sequence(ShardId(2))), 120);
}

// ============================================================================
// Idempotence
// ============================================================================

#[test]
fn test_second_bootstrap_reuses_data() {
    let store = MemoryStore::new("bootstrap-reuse");
    let ctx = Context::background();
    let scenario = Conservation::new(1000);

    scenario.prepare(&store, &ctx, ShardId(0), &setup(300)).unwrap();
    let before = store.dump(&TableName::ledger(ShardId(0))).unwrap();
    let version = store.current_version();

    let outcome = scenario.prepare(&store, &ctx, ShardId(0), &setup(300)).unwrap();
    assert_eq!(outcome, BootstrapOutcome::Reused);
    assert_eq!(store.dump(&TableName::ledger(ShardId(0))).unwrap(), before);
    assert_eq!(store.current_version(), version);
}

#[test]
fn test_corrupted_data_is_rebuilt() {
    let store = MemoryStore::new("bootstrap-rebuild");
    let ctx = Context::background();
    let scenario = Conservation::new(1000);
    scenario.prepare(&store, &ctx, ShardId(0), &setup(50)).unwrap();

    store
        .exec(
            &ctx,
            &Statement::UpdateBalance {
                table: TableName::ledger(ShardId(0)),
                id: 7,
                balance: 0,
            },
        )
        .unwrap();
    assert!(scenario.verify(&store, &ctx, 50, ShardId(0), "up").is_err());

    let outcome = scenario.prepare(&store, &ctx, ShardId(0), &setup(50)).unwrap();
    assert_eq!(outcome, BootstrapOutcome::Rebuilt { batches: 1 });
    scenario.verify(&store, &ctx, 50, ShardId(0), "up").unwrap();
}

#[test]
fn test_partial_load_is_rebuilt() {
    let store = MemoryStore::new("bootstrap-partial");
    let ctx = Context::background();
    let scenario = Conservation::new(1000);
    store.exec(&ctx, &scenario.create_table(ShardId(0))).unwrap();
    store
        .exec(&ctx, &scenario.seed_batch(ShardId(0), 0, 100))
        .unwrap();

    let outcome = scenario.prepare(&store, &ctx, ShardId(0), &setup(250)).unwrap();
    assert_eq!(outcome, BootstrapOutcome::Rebuilt { batches: 3 });
    assert_eq!(count(&store, TableName::ledger(ShardId(0))), 250);
}

#[test]
fn test_partial_sequence_table_is_reused() {
    // untouched rows are all zero, so a short table still has no gap
    let store = MemoryStore::new("bootstrap-partial-sequence");
    let ctx = Context::background();
    store.exec(&ctx, &Sequence.create_table(ShardId(0))).unwrap();
    store
        .exec(&ctx, &Sequence.seed_batch(ShardId(0), 0, 100))
        .unwrap();

    let outcome = Sequence.prepare(&store, &ctx, ShardId(0), &setup(250)).unwrap();
    assert_eq!(outcome, BootstrapOutcome::Reused);
    assert_eq!(count(&store, TableName::sequence(ShardId(0))), 100);
}

// ============================================================================
// Cleanup
// ============================================================================

#[test]
fn test_cleanup_semantics() {
    let store = MemoryStore::new("bootstrap-cleanup");
    let ctx = Context::background();
    let setup = setup(10);

    // missing table counts as dropped
    assert!(Sequence.cleanup(&store, &ctx, ShardId(0), &setup, false).unwrap());

    Sequence.prepare(&store, &ctx, ShardId(0), &setup).unwrap();
    assert!(!Sequence.cleanup(&store, &ctx, ShardId(0), &setup, false).unwrap());
    assert!(store.dump(&TableName::sequence(ShardId(0))).is_some());

    assert!(Sequence.cleanup(&store, &ctx, ShardId(0), &setup, true).unwrap());
    assert!(store.dump(&TableName::sequence(ShardId(0))).is_none());
}

// ============================================================================
// Retry
// ============================================================================

#[test]
fn test_faults_below_budget_are_absorbed() {
    let store = MemoryStore::new("bootstrap-faults");
    let ctx = Context::background();
    store.inject_failures(3);

    let outcome = Conservation::new(1000)
        .prepare(&store, &ctx, ShardId(0), &setup(200))
        .unwrap();
    assert_eq!(outcome, BootstrapOutcome::Rebuilt { batches: 2 });
    assert_eq!(store.pending_failures(), 0);
    assert_eq!(count(&store, TableName::ledger(ShardId(0))), 200);
}

#[test]
fn test_faults_above_budget_fail_setup() {
    let store = MemoryStore::new("bootstrap-exhausted");
    let ctx = Context::background();
    store.inject_failures(50);

    let mut options = setup(200);
    options.retry = options.retry.with_max_attempts(3);
    let err = Conservation::new(1000)
        .prepare(&store, &ctx, ShardId(0), &options)
        .unwrap_err();

    match &err {
        Error::SetupFailed { attempts, source, .. } => {
            assert_eq!(*attempts, 3);
            assert!(source.is_transient());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_fatal());
}

#[test]
fn test_cancelled_bootstrap_stops() {
    let store = MemoryStore::new("bootstrap-cancelled");
    let token = CancelToken::new();
    token.cancel();
    let err = Conservation::new(1000)
        .prepare(&store, &Context::new(token), ShardId(0), &setup(100))
        .unwrap_err();
    assert!(err.is_cancellation());
}

#[test]
fn test_barrier_helpers_share_retry_policy() {
    let store = MemoryStore::new("bootstrap-drop");
    let ctx = Context::background();
    store.exec(&ctx, &Statement::CreateTable(TableName::barrier())).unwrap();
    store.inject_failures(1);
    bootstrap::drop_table(&store, &ctx, &TableName::barrier(), &setup(2).retry).unwrap();
    assert!(store.table_names().is_empty());
}

// ============================================================================
// SQLite
// ============================================================================

#[test]
fn test_sqlite_bootstrap_and_reuse() {
    let temp_dir = TempDir::new().unwrap();
    let store = SqliteStore::open(temp_dir.path().join("up.db"), 4).unwrap();
    let ctx = Context::background();

    for scenario in tally_engine::default_scenarios(1000) {
        let outcome = scenario.prepare(&store, &ctx, ShardId(0), &setup(250)).unwrap();
        assert_eq!(outcome, BootstrapOutcome::Rebuilt { batches: 3 });
        scenario.verify(&store, &ctx, 250, ShardId(0), "up").unwrap();
    }
    for scenario in tally_engine::default_scenarios(1000) {
        let outcome = scenario.prepare(&store, &ctx, ShardId(0), &setup(250)).unwrap();
        assert_eq!(outcome, BootstrapOutcome::Reused);
    }
}
