//! Sync barrier
//!
//! An empty `finishmark` table created upstream after bootstrap. The
//! replication pipeline applies DDL in order, so once the table is visible
//! downstream every earlier schema change and seed insert is there too.

use std::time::{Duration, Instant};

use tally_core::{Context, Error, Result, Statement, TableName};
use tally_storage::Store;
use tracing::{debug, info};

use crate::bootstrap::drop_table;
use crate::retry::{self, RetryPolicy};

/// Create the barrier table upstream
pub fn install(upstream: &dyn Store, ctx: &Context, policy: &RetryPolicy) -> Result<()> {
    let table = TableName::barrier();
    let stmt = Statement::CreateTable(table.clone());
    retry::run(ctx, policy, &format!("create {}", table), || {
        upstream.exec(ctx, &stmt)
    })?;
    info!(store = upstream.name(), table = %table, "barrier installed");
    Ok(())
}

/// Poll `downstream` until the barrier table shows up
///
/// Probe failures keep polling. Running past `timeout` is
/// [`Error::BarrierTimeout`]; cancellation of `ctx` is returned as-is.
pub fn wait(
    downstream: &dyn Store,
    ctx: &Context,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Duration> {
    let table = TableName::barrier();
    let started = Instant::now();
    let ctx = ctx.with_timeout(timeout);
    let timed_out = || Error::BarrierTimeout {
        table: table.to_string(),
        store: downstream.name().to_string(),
        waited: started.elapsed(),
    };

    loop {
        match downstream.table_exists(&ctx, &table) {
            Ok(true) => {
                let waited = started.elapsed();
                info!(store = downstream.name(), ?waited, "barrier observed downstream");
                return Ok(waited);
            }
            Ok(false) => {}
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(Error::DeadlineExceeded) => return Err(timed_out()),
            Err(e) => debug!(store = downstream.name(), error = %e, "barrier probe failed"),
        }
        match ctx.sleep(poll_interval) {
            Ok(()) => {}
            Err(Error::DeadlineExceeded) => return Err(timed_out()),
            Err(e) => return Err(e),
        }
    }
}

/// Drop the barrier table
pub fn remove(store: &dyn Store, ctx: &Context, policy: &RetryPolicy) -> Result<()> {
    drop_table(store, ctx, &TableName::barrier(), policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tally_core::CancelToken;
    use tally_storage::MemoryStore;

    #[test]
    fn test_seen_immediately_on_loopback() {
        let store = MemoryStore::new("barrier-loopback");
        let ctx = Context::background();
        install(&store, &ctx, &RetryPolicy::no_retry()).unwrap();
        wait(&store, &ctx, Duration::from_secs(1), Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_times_out_when_never_replicated() {
        let down = MemoryStore::new("barrier-missing");
        let started = Instant::now();
        let err = wait(
            &down,
            &Context::background(),
            Duration::from_millis(100),
            Duration::from_millis(20),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BarrierTimeout { .. }));
        assert!(err.is_fatal());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_late_arrival() {
        let down = MemoryStore::new("barrier-late");
        let writer = down.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            install(&writer, &Context::background(), &RetryPolicy::no_retry()).unwrap();
        });
        wait(
            &down,
            &Context::background(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let down = MemoryStore::new("barrier-cancel");
        let token = CancelToken::new();
        let ctx = Context::new(token.clone());
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            token.cancel();
        });
        let err = wait(&down, &ctx, Duration::from_secs(30), Duration::from_secs(1)).unwrap_err();
        assert!(err.is_cancellation());
        canceller.join().unwrap();
    }

    #[test]
    fn test_remove() {
        let store = MemoryStore::new("barrier-remove");
        let ctx = Context::background();
        install(&store, &ctx, &RetryPolicy::no_retry()).unwrap();
        remove(&store, &ctx, &RetryPolicy::no_retry()).unwrap();
        assert!(!store.table_exists(&ctx, &TableName::barrier()).unwrap());
    }
}
