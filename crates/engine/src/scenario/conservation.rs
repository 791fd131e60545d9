//! Balance conservation
//!
//! Each round moves a random amount between two distinct accounts of
//! `ledger{shard}`. Transfers never create or destroy money, so on any
//! consistent snapshot the shard's total stays at
//! `accounts * initial_balance`.

use rand::rngs::StdRng;
use rand::Rng;
use tally_core::{
    Context, Error, LedgerRow, Query, Result, ShardId, Statement, TableName, Violation,
    ViolationKind,
};
use tally_storage::{Store, Transaction};
use tracing::{debug, info};

use super::Scenario;

/// Scenario name
pub const NAME: &str = "conservation";

/// Transfers between accounts; total balance is constant
#[derive(Debug, Clone, Copy)]
pub struct Conservation {
    initial_balance: i64,
}

impl Conservation {
    /// Scenario whose accounts each start with `initial_balance`
    pub fn new(initial_balance: i64) -> Self {
        Self { initial_balance }
    }

    /// Balance every account is seeded with
    pub fn initial_balance(&self) -> i64 {
        self.initial_balance
    }
}

/// Two distinct ids, uniform over `[0, accounts)`
fn pick_pair(rng: &mut StdRng, accounts: usize) -> (i64, i64) {
    let from = rng.gen_range(0..accounts);
    let mut to = rng.gen_range(0..accounts - 1);
    if to >= from {
        to += 1;
    }
    (from as i64, to as i64)
}

fn balance(txn: &mut dyn Transaction, ctx: &Context, table: &TableName, id: i64) -> Result<i64> {
    txn.query(
        ctx,
        &Query::Balance {
            table: table.clone(),
            id,
            for_update: true,
        },
    )?
    .scalar()
}

impl Scenario for Conservation {
    fn name(&self) -> &'static str {
        NAME
    }

    fn table(&self, shard: ShardId) -> TableName {
        TableName::ledger(shard)
    }

    fn seed_batch(&self, shard: ShardId, offset: usize, size: usize) -> Statement {
        let rows = (offset..offset + size)
            .map(|id| LedgerRow {
                id: id as i64,
                balance: self.initial_balance,
            })
            .collect();
        Statement::InsertLedger {
            table: self.table(shard),
            rows,
        }
    }

    fn workload(
        &self,
        txn: &mut dyn Transaction,
        ctx: &Context,
        accounts: usize,
        shard: ShardId,
        rng: &mut StdRng,
    ) -> Result<()> {
        if accounts < 2 {
            return Err(Error::Config(format!(
                "{} needs at least 2 accounts, got {}",
                NAME, accounts
            )));
        }
        let table = self.table(shard);
        let (from, to) = pick_pair(rng, accounts);

        let from_balance = balance(txn, ctx, &table, from)?;
        let to_balance = balance(txn, ctx, &table, to)?;

        // from_balance / 2 keeps the source non-negative
        let amount = rng.gen_range(0..=from_balance.max(0) / 2);

        txn.exec(
            ctx,
            &Statement::UpdateBalance {
                table: table.clone(),
                id: from,
                balance: from_balance - amount,
            },
        )?;
        txn.exec(
            ctx,
            &Statement::UpdateBalance {
                table,
                id: to,
                balance: to_balance + amount,
            },
        )?;
        debug!(shard = shard.0, from, to, amount, "transfer staged");
        Ok(())
    }

    fn verify(
        &self,
        store: &dyn Store,
        ctx: &Context,
        accounts: usize,
        shard: ShardId,
        tag: &str,
    ) -> Result<()> {
        let table = self.table(shard);
        let violation = |kind| Violation {
            shard,
            scenario: NAME,
            tag: tag.to_string(),
            kind,
        };

        let expected = accounts as i64 * self.initial_balance;
        let observed = store.query(ctx, &Query::SumBalance(table.clone()))?.scalar()?;
        if observed != expected {
            return Err(violation(ViolationKind::BalanceSum { expected, observed }).into());
        }

        let expected = accounts as i64;
        let observed = store.query(ctx, &Query::CountRows(table))?.scalar()?;
        if observed != expected {
            return Err(violation(ViolationKind::RowCount { expected, observed }).into());
        }

        info!(shard = shard.0, scenario = NAME, tag, total = observed, "verify pass");
        Ok(())
    }
}
