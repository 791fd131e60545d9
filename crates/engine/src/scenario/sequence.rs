//! Monotonic sequence
//!
//! Row 0 of `sequence{shard}` is a cursor holding `(counter, max sequence)`.
//! Every round locks the cursor, picks the next row from the counter, and
//! stamps both the cursor and that row with `max + 1`. Applied in commit
//! order, the sorted `sequence` column can only ever step by 0 or 1; a larger
//! jump means a commit went missing or was applied out of order.

use rand::rngs::StdRng;
use tally_core::{
    Context, Error, Query, Result, SequenceRow, ShardId, Statement, TableName, Violation,
    ViolationKind,
};
use tally_storage::{Store, Transaction};
use tracing::{debug, info};

use super::Scenario;

/// Scenario name
pub const NAME: &str = "sequence";

/// Cursor-driven counter; sequence values never skip
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequence;

/// First consecutive pair in `sorted` that breaks the 0-or-1 step rule
///
/// Pairs whose earlier value is 0 are skipped: rows not touched yet still
/// carry their seed value.
pub fn first_gap(sorted: &[i64]) -> Option<(i64, i64)> {
    sorted.windows(2).find_map(|pair| {
        let (previous, current) = (pair[0], pair[1]);
        if previous == 0 || current == previous || current == previous + 1 {
            None
        } else {
            Some((previous, current))
        }
    })
}

/// Row to stamp and the counter after this round
fn advance(counter: i64, accounts: i64) -> (i64, i64) {
    let mut counter = counter;
    let mut next = counter % accounts;
    if next == 0 {
        // row 0 is the cursor itself
        next += 1;
        counter += 1;
    }
    (next, counter + 1)
}

impl Scenario for Sequence {
    fn name(&self) -> &'static str {
        NAME
    }

    fn table(&self, shard: ShardId) -> TableName {
        TableName::sequence(shard)
    }

    fn seed_batch(&self, shard: ShardId, offset: usize, size: usize) -> Statement {
        let rows = (offset..offset + size)
            .map(|id| SequenceRow {
                id: id as i64,
                counter: 0,
                sequence: 0,
            })
            .collect();
        Statement::InsertSequence {
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
        _rng: &mut StdRng,
    ) -> Result<()> {
        let table = self.table(shard);
        let cursor = txn.query(
            ctx,
            &Query::Cursor {
                table: table.clone(),
                id: 0,
                for_update: true,
            },
        )?;
        let (counter, max_sequence) = match cursor.first() {
            Some([counter, sequence, ..]) => (*counter, *sequence),
            _ => return Err(Error::Store(format!("cursor row missing from {}", table))),
        };

        let (next, counter) = advance(counter, accounts.max(1) as i64);
        let sequence = max_sequence + 1;
        txn.exec(
            ctx,
            &Statement::UpdateSequence {
                table,
                ids: vec![0, next],
                counter,
                sequence,
            },
        )?;
        debug!(shard = shard.0, row = next, sequence, "sequence staged");
        Ok(())
    }

    fn verify(
        &self,
        store: &dyn Store,
        ctx: &Context,
        _accounts: usize,
        shard: ShardId,
        tag: &str,
    ) -> Result<()> {
        let values = store
            .query(ctx, &Query::Sequences(self.table(shard)))?
            .column(0);
        if let Some((previous, current)) = first_gap(&values) {
            return Err(Violation {
                shard,
                scenario: NAME,
                tag: tag.to_string(),
                kind: ViolationKind::SequenceGap { previous, current },
            }
            .into());
        }
        info!(
            shard = shard.0,
            scenario = NAME,
            tag,
            max = values.last().copied().unwrap_or(0),
            "verify pass"
        );
        Ok(())
    }
}
