//! Workload and verification engine for tally
//!
//! This crate drives everything above the store adapter:
//! - retry: bounded retries for setup operations
//! - bootstrap: idempotent dataset setup with a batched insert pool
//! - scenario: the invariant contract and its two built-in scenarios
//! - barrier: the downstream sync point
//! - driver: the per-shard workload/verify loops and run lifecycle
//!
//! Workload transactions never go through the retry executor: a failed
//! round rolls back and the next one starts fresh.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod barrier;
pub mod bootstrap;
pub mod driver;
pub mod retry;
pub mod scenario;

pub use bootstrap::{plan_batches, Batch, BootstrapOutcome, SetupOptions};
pub use driver::{Harness, Outcome, Phase, RunReport, RunState};
pub use retry::RetryPolicy;
pub use scenario::{default_scenarios, Conservation, Scenario, ScenarioKind, Sequence};
