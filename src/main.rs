//! `tally` binary.
//!
//! Exit codes: 0 when the round target is reached or cleanup finished, 1 on
//! a fatal run error (violation, setup failure, barrier timeout), 2 on bad
//! arguments or configuration.

use std::process::ExitCode;

use anyhow::Context as _;
use tally::cli::{build_cli, is_usage_error, resolve_config};
use tally::logging::init_logging;
use tally::{CancelToken, Harness, HarnessConfig, RunReport};
use tracing::error;

fn main() -> ExitCode {
    let matches = build_cli().get_matches();
    let level = matches
        .get_one::<String>("log-level")
        .map(|s| s.as_str())
        .unwrap_or("info");
    init_logging(level);

    let json = matches.get_flag("json");
    let result = resolve_config(&matches)
        .context("invalid configuration")
        .and_then(run);

    match result {
        Ok(report) => {
            print_report(&report, json);
            ExitCode::SUCCESS
        }
        Err(e) if is_usage_error(&e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "run failed");
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(config: HarnessConfig) -> anyhow::Result<RunReport> {
    let harness = Harness::open(config).context("failed to open stores")?;
    let report = harness
        .run(&CancelToken::new())
        .with_context(|| format!("run {} aborted", harness.run_id()))?;
    Ok(report)
}

fn print_report(report: &RunReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("failed to encode report: {}", e),
        }
    } else {
        println!(
            "run {}: {:?} after {} verified round(s), {} commit(s), \
             {} failed workload round(s), {:.1}s",
            report.run_id,
            report.outcome,
            report.rounds_verified,
            report.commits,
            report.failed_rounds,
            report.elapsed.as_secs_f64()
        );
    }
}
