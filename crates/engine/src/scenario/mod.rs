//! Invariant scenarios
//!
//! A scenario owns one table per shard and knows how to:
//! - `prepare`: build (or reuse) its dataset
//! - `workload`: apply one invariant-preserving mutation inside a shared
//!   transaction
//! - `verify`: check its invariant against a store
//! - `cleanup`: drop its table when forced or when the data is bad
//!
//! `prepare` and `cleanup` have shared default implementations on top of
//! the bootstrapper; a new scenario only has to describe its table and
//! implement `workload` and `verify`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::rngs::StdRng;
use tally_core::{Context, Error, Result, ShardId, Statement, TableName};
use tally_storage::{Store, Transaction};

use crate::bootstrap::{self, BootstrapOutcome, SetupOptions};

pub mod conservation;
pub mod sequence;

pub use conservation::Conservation;
pub use sequence::{first_gap, Sequence};

/// One self-contained invariant plus the workload that must preserve it
pub trait Scenario: Send + Sync {
    /// Short name used in logs and violations
    fn name(&self) -> &'static str;

    /// The scenario's table in `shard`
    fn table(&self, shard: ShardId) -> TableName;

    /// `CREATE TABLE` for the scenario's table
    fn create_table(&self, shard: ShardId) -> Statement {
        Statement::CreateTable(self.table(shard))
    }

    /// Insert-if-absent statement for rows `offset..offset + size`
    fn seed_batch(&self, shard: ShardId, offset: usize, size: usize) -> Statement;

    /// Build the dataset, reusing existing data that still verifies
    fn prepare(
        &self,
        store: &dyn Store,
        ctx: &Context,
        shard: ShardId,
        setup: &SetupOptions,
    ) -> Result<BootstrapOutcome> {
        bootstrap::bootstrap(store, ctx, self, shard, setup)
    }

    /// One mutation inside `txn`; the caller commits
    fn workload(
        &self,
        txn: &mut dyn Transaction,
        ctx: &Context,
        accounts: usize,
        shard: ShardId,
        rng: &mut StdRng,
    ) -> Result<()>;

    /// Check the invariant; `tag` names the side being checked
    fn verify(
        &self,
        store: &dyn Store,
        ctx: &Context,
        accounts: usize,
        shard: ShardId,
        tag: &str,
    ) -> Result<()>;

    /// Drop the table if forced, missing, or failing verification
    ///
    /// Returns whether the table was dropped.
    fn cleanup(
        &self,
        store: &dyn Store,
        ctx: &Context,
        shard: ShardId,
        setup: &SetupOptions,
        force: bool,
    ) -> Result<bool> {
        bootstrap::cleanup(store, ctx, self, shard, setup, force)
    }
}

/// Built-in scenarios, selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    /// Balance transfers; total balance is constant
    Conservation,
    /// Cursor-driven counter; sequence values never skip
    Sequence,
}

impl ScenarioKind {
    /// Every built-in scenario, in workload order
    pub const ALL: [ScenarioKind; 2] = [ScenarioKind::Sequence, ScenarioKind::Conservation];

    /// Name as accepted by [`FromStr`]
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioKind::Conservation => conservation::NAME,
            ScenarioKind::Sequence => sequence::NAME,
        }
    }

    /// Instantiate the scenario
    pub fn build(&self, initial_balance: i64) -> Arc<dyn Scenario> {
        match self {
            ScenarioKind::Conservation => Arc::new(Conservation::new(initial_balance)),
            ScenarioKind::Sequence => Arc::new(Sequence),
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenarioKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conservation" | "bank" => Ok(ScenarioKind::Conservation),
            "sequence" => Ok(ScenarioKind::Sequence),
            other => Err(Error::Config(format!("unknown scenario '{}'", other))),
        }
    }
}

/// The sequence scenario followed by the conservation scenario
pub fn default_scenarios(initial_balance: i64) -> Vec<Arc<dyn Scenario>> {
    ScenarioKind::ALL
        .iter()
        .map(|kind| kind.build(initial_balance))
        .collect()
}
