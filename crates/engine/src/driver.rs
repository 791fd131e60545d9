//! Consistency loop driver
//!
//! Owns one run of the harness: bootstrap every shard upstream, wait for the
//! sync barrier downstream, then run a workload thread and a verify thread
//! per shard until the verified-round target is reached, the caller cancels,
//! or a verify pass fails.
//!
//! ## Phases
//!
//! ```text
//! Bootstrapping -> AwaitingBarrier -> Running -> Draining -> Stopped
//! ```
//!
//! Every transition is logged and visible through [`Harness::phase`].
//! Cleanup-only runs go straight from `Bootstrapping` to `Stopped`.
//!
//! ## Failure policy
//!
//! - workload failures are logged, counted and retried on the next iteration
//! - verify failures (violations, timeouts, store errors) end the run with
//!   that error
//! - setup failures and a barrier timeout end the run before any workload

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tally_core::{CancelToken, Context, Error, HarnessConfig, Result, ShardId};
use tally_storage::{registry, OpenOptions, Store};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::barrier;
use crate::bootstrap::SetupOptions;
use crate::scenario::{default_scenarios, Scenario};

/// How often the coordinating thread re-checks for cancellation
const DRAIN_POLL: Duration = Duration::from_millis(200);

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Preparing datasets upstream
    Bootstrapping,
    /// Barrier installed, polling downstream
    AwaitingBarrier,
    /// Workload and verify threads are live
    Running,
    /// Cancellation observed, threads are returning
    Draining,
    /// Terminal
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Bootstrapping => "bootstrapping",
            Phase::AwaitingBarrier => "awaiting_barrier",
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Counters shared by every task of a run
#[derive(Debug)]
pub struct RunState {
    rounds: AtomicU64,
    target: u64,
    commits: AtomicU64,
    failed_rounds: AtomicU64,
    cancel: CancelToken,
}

impl RunState {
    /// State for a run that stops after `target` verify passes (0 = never)
    pub fn new(target: u64, cancel: CancelToken) -> Self {
        Self {
            rounds: AtomicU64::new(0),
            target,
            commits: AtomicU64::new(0),
            failed_rounds: AtomicU64::new(0),
            cancel,
        }
    }

    /// Count one full verify pass; cancels the run on reaching the target
    pub fn record_pass(&self) -> u64 {
        let passes = self.rounds.fetch_add(1, Ordering::AcqRel) + 1;
        if self.target > 0 && passes >= self.target {
            self.cancel.cancel();
        }
        passes
    }

    /// Count one committed workload transaction
    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one failed workload transaction
    pub fn record_failure(&self) {
        self.failed_rounds.fetch_add(1, Ordering::Relaxed);
    }

    /// Verify passes so far
    pub fn rounds_verified(&self) -> u64 {
        self.rounds.load(Ordering::Acquire)
    }

    /// Committed workload transactions so far
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Failed workload transactions so far
    pub fn failed_rounds(&self) -> u64 {
        self.failed_rounds.load(Ordering::Relaxed)
    }

    /// Whether the round target was reached
    pub fn target_reached(&self) -> bool {
        self.target > 0 && self.rounds_verified() >= self.target
    }

    /// The run's cancellation token
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Why a run ended without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The verified-round target was reached
    Completed,
    /// The caller cancelled
    Cancelled,
    /// Cleanup-only run finished
    CleanedUp,
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Identifier attached to every log line of the run
    pub run_id: Uuid,
    /// Verify passes completed across all shards
    pub rounds_verified: u64,
    /// Committed workload transactions
    pub commits: u64,
    /// Workload transactions that failed and rolled back
    pub failed_rounds: u64,
    /// Number of shards
    pub shards: u32,
    /// Wall time of the run
    pub elapsed: Duration,
    /// How the run ended
    pub outcome: Outcome,
}

/// One configured harness run against an upstream and a downstream store
pub struct Harness {
    config: HarnessConfig,
    upstream: Arc<dyn Store>,
    downstream: Arc<dyn Store>,
    scenarios: Vec<Arc<dyn Scenario>>,
    phase: Mutex<Phase>,
    run_id: Uuid,
}

impl Harness {
    /// Harness over already opened stores, running the default scenarios
    pub fn new(
        config: HarnessConfig,
        upstream: Arc<dyn Store>,
        downstream: Arc<dyn Store>,
    ) -> Result<Self> {
        config.validate()?;
        let scenarios = default_scenarios(config.initial_balance);
        Ok(Self {
            config,
            upstream,
            downstream,
            scenarios,
            phase: Mutex::new(Phase::Bootstrapping),
            run_id: Uuid::new_v4(),
        })
    }

    /// Open both stores from the configured DSNs
    pub fn open(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let options = OpenOptions {
            lock_wait_timeout: config.lock_wait_timeout(),
            ..OpenOptions::default()
        };
        let upstream = registry::open(&config.upstream, &options)?;
        let downstream = registry::open(&config.downstream, &options)?;
        Self::new(config, upstream, downstream)
    }

    /// Replace the scenario list; order is the workload order
    pub fn with_scenarios(mut self, scenarios: Vec<Arc<dyn Scenario>>) -> Self {
        self.scenarios = scenarios;
        self
    }

    /// Identifier of this run
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Effective configuration
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn set_phase(&self, next: Phase) {
        let mut phase = self.phase.lock();
        let previous = *phase;
        if previous != next {
            info!(run_id = %self.run_id, from = %previous, to = %next, "phase transition");
            *phase = next;
        }
    }

    fn shards(&self) -> impl Iterator<Item = ShardId> {
        (0..self.config.tables).map(ShardId)
    }

    fn stores(&self) -> [&dyn Store; 2] {
        [self.upstream.as_ref(), self.downstream.as_ref()]
    }

    /// Run to completion
    ///
    /// `cancel` stops the run from outside; the harness also cancels it
    /// itself when the round target is reached or a verify pass fails, so
    /// the token is always cancelled once a `Running` phase ends.
    pub fn run(&self, cancel: &CancelToken) -> Result<RunReport> {
        let started = Instant::now();
        let ctx = Context::new(cancel.clone());
        let setup = SetupOptions::from_config(&self.config);
        let state = RunState::new(self.config.rounds, cancel.clone());
        info!(
            run_id = %self.run_id,
            upstream = self.upstream.name(),
            downstream = self.downstream.name(),
            shards = self.config.tables,
            accounts = self.config.accounts,
            "run starting"
        );

        if self.config.cleanup_only {
            let result = self.cleanup_all(&ctx, &setup);
            self.set_phase(Phase::Stopped);
            return match result {
                Ok(()) => {
                    info!(run_id = %self.run_id, "cleanup done");
                    Ok(self.report(&state, started, Outcome::CleanedUp))
                }
                Err(e) if e.is_cancellation() => {
                    Ok(self.report(&state, started, Outcome::Cancelled))
                }
                Err(e) => Err(e),
            };
        }

        match self.prepare(&ctx, &setup) {
            Ok(()) => {}
            Err(e) => {
                self.set_phase(Phase::Stopped);
                if e.is_cancellation() {
                    return Ok(self.report(&state, started, Outcome::Cancelled));
                }
                error!(run_id = %self.run_id, error = %e, "setup failed");
                return Err(e);
            }
        }

        self.set_phase(Phase::Running);
        let fatal = self.run_loops(&state)?;
        self.set_phase(Phase::Stopped);

        if let Some(e) = fatal {
            error!(run_id = %self.run_id, error = %e, "run aborted");
            return Err(e);
        }
        let outcome = if state.target_reached() {
            Outcome::Completed
        } else {
            Outcome::Cancelled
        };
        let report = self.report(&state, started, outcome);
        info!(
            run_id = %self.run_id,
            rounds = report.rounds_verified,
            commits = report.commits,
            failed = report.failed_rounds,
            "run finished"
        );
        Ok(report)
    }

    fn prepare(&self, ctx: &Context, setup: &SetupOptions) -> Result<()> {
        self.set_phase(Phase::Bootstrapping);
        for shard in self.shards() {
            for scenario in &self.scenarios {
                let outcome = scenario.prepare(self.upstream.as_ref(), ctx, shard, setup)?;
                info!(
                    run_id = %self.run_id,
                    shard = shard.0,
                    scenario = scenario.name(),
                    ?outcome,
                    "shard prepared"
                );
            }
        }

        self.set_phase(Phase::AwaitingBarrier);
        barrier::install(self.upstream.as_ref(), ctx, &setup.retry)?;
        barrier::wait(
            self.downstream.as_ref(),
            ctx,
            self.config.barrier_timeout(),
            self.config.barrier_poll_interval(),
        )?;
        info!(run_id = %self.run_id, "all tables synced");
        Ok(())
    }

    /// Spawn the per-shard loops and wait for them; returns the first fatal error
    fn run_loops(&self, state: &RunState) -> Result<Option<Error>> {
        let fatal: Mutex<Option<Error>> = Mutex::new(None);
        let abort = |e: Error| {
            fatal.lock().get_or_insert(e);
            state.cancel_token().cancel();
        };
        let abort = &abort;

        thread::scope(|scope| -> Result<()> {
            for shard in self.shards() {
                let verify = move || {
                    if let Err(e) = self.verify_loop(state, shard) {
                        abort(e);
                    }
                };
                let workload = move || self.workload_loop(state, shard);

                let spawned = thread::Builder::new()
                    .name(format!("tally-verify-{}", shard))
                    .spawn_scoped(scope, verify)
                    .and_then(|_| {
                        thread::Builder::new()
                            .name(format!("tally-workload-{}", shard))
                            .spawn_scoped(scope, workload)
                    });
                if let Err(e) = spawned {
                    abort(Error::Io(e));
                    break;
                }
            }

            while !state.cancel_token().wait_timeout(DRAIN_POLL) {}
            self.set_phase(Phase::Draining);
            Ok(())
        })?;

        Ok(fatal.into_inner())
    }

    fn verify_loop(&self, state: &RunState, shard: ShardId) -> Result<()> {
        let ctx = Context::new(state.cancel_token().clone());
        let accounts = self.config.accounts;
        loop {
            if ctx.sleep(self.config.verify_interval()).is_err() {
                return Ok(());
            }
            for scenario in &self.scenarios {
                for store in self.stores() {
                    let call = ctx.with_timeout(self.config.verify_timeout());
                    match scenario.verify(store, &call, accounts, shard, store.name()) {
                        Ok(()) => {}
                        Err(e) if e.violation().is_some() => {
                            error!(
                                run_id = %self.run_id,
                                shard = shard.0,
                                scenario = scenario.name(),
                                tag = store.name(),
                                error = %e,
                                "verify failed"
                            );
                            return Err(e);
                        }
                        Err(e) if e.is_cancellation() || ctx.token().is_cancelled() => {
                            return Ok(())
                        }
                        Err(e) => {
                            error!(
                                run_id = %self.run_id,
                                shard = shard.0,
                                scenario = scenario.name(),
                                tag = store.name(),
                                error = %e,
                                "verify could not complete"
                            );
                            return Err(e);
                        }
                    }
                }
            }
            let passes = state.record_pass();
            info!(run_id = %self.run_id, shard = shard.0, passes, "verify round complete");
        }
    }

    fn workload_loop(&self, state: &RunState, shard: ShardId) {
        let ctx = Context::new(state.cancel_token().clone());
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(u64::from(shard.0))),
            None => StdRng::from_entropy(),
        };
        while !ctx.token().is_cancelled() {
            let attempt = ctx.with_timeout(self.config.workload_timeout());
            match self.workload_round(&attempt, shard, &mut rng) {
                Ok(()) => state.record_commit(),
                Err(e) if e.is_cancellation() || ctx.token().is_cancelled() => break,
                Err(e) => {
                    state.record_failure();
                    warn!(run_id = %self.run_id, shard = shard.0, error = %e, "workload failed");
                    let pause = self.config.workload_pause();
                    if !pause.is_zero() && ctx.sleep(pause).is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// One transaction carrying every scenario's mutation for `shard`
    fn workload_round(&self, ctx: &Context, shard: ShardId, rng: &mut StdRng) -> Result<()> {
        let mut txn = self.upstream.begin(ctx)?;
        for scenario in &self.scenarios {
            scenario.workload(txn.as_mut(), ctx, self.config.accounts, shard, rng)?;
        }
        txn.commit(ctx)
    }

    fn cleanup_all(&self, ctx: &Context, setup: &SetupOptions) -> Result<()> {
        for shard in self.shards() {
            for scenario in &self.scenarios {
                for store in self.stores() {
                    scenario.cleanup(store, ctx, shard, setup, true)?;
                }
            }
        }
        for store in self.stores() {
            barrier::remove(store, ctx, &setup.retry)?;
        }
        Ok(())
    }

    fn report(&self, state: &RunState, started: Instant, outcome: Outcome) -> RunReport {
        RunReport {
            run_id: self.run_id,
            rounds_verified: state.rounds_verified(),
            commits: state.commits(),
            failed_rounds: state.failed_rounds(),
            shards: self.config.tables,
            elapsed: started.elapsed(),
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_pass_cancels_at_target() {
        let token = CancelToken::new();
        let state = RunState::new(3, token.clone());
        assert_eq!(state.record_pass(), 1);
        assert_eq!(state.record_pass(), 2);
        assert!(!token.is_cancelled());
        assert_eq!(state.record_pass(), 3);
        assert!(token.is_cancelled());
        assert!(state.target_reached());
    }

    #[test]
    fn test_zero_target_is_unbounded() {
        let token = CancelToken::new();
        let state = RunState::new(0, token.clone());
        for _ in 0..100 {
            state.record_pass();
        }
        assert!(!token.is_cancelled());
        assert!(!state.target_reached());
    }

    #[test]
    fn test_counters() {
        let state = RunState::new(0, CancelToken::new());
        state.record_commit();
        state.record_commit();
        state.record_failure();
        assert_eq!(state.commits(), 2);
        assert_eq!(state.failed_rounds(), 1);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::AwaitingBarrier.to_string(), "awaiting_barrier");
        assert_eq!(Phase::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = HarnessConfig {
            accounts: 1,
            ..Default::default()
        };
        let store: Arc<dyn Store> = Arc::new(tally_storage::MemoryStore::new("driver-invalid"));
        assert!(Harness::new(config, store.clone(), store).is_err());
    }
}
