//! Command-line interface.
//!
//! Settings are layered: built-in defaults, then the config file (`--config`,
//! or `tally.toml` in the working directory if present), then flags.

use std::path::{Path, PathBuf};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tally_core::{Error, HarnessConfig, Result, CONFIG_FILE_NAME};

/// Build the `tally` command.
pub fn build_cli() -> Command {
    Command::new("tally")
        .about("Consistency harness for data-replication pipelines")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("upstream")
                .long("upstream")
                .value_name("DSN")
                .help("Store the workload writes to (memory:<name>, sqlite:<path> or a path)"),
        )
        .arg(
            Arg::new("downstream")
                .long("downstream")
                .value_name("DSN")
                .help("Replica to verify"),
        )
        .arg(
            Arg::new("accounts")
                .long("accounts")
                .value_parser(value_parser!(usize))
                .help("Rows per table (default: 1000)"),
        )
        .arg(
            Arg::new("tables")
                .long("tables")
                .value_parser(value_parser!(u32))
                .help("Number of shards (default: 1)"),
        )
        .arg(
            Arg::new("concurrency")
                .long("concurrency")
                .value_parser(value_parser!(usize))
                .help("Bulk-insert workers during bootstrap (default: 10)"),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .value_name("MS")
                .value_parser(value_parser!(u64))
                .help("Milliseconds between verify passes (default: 2000)"),
        )
        .arg(
            Arg::new("rounds")
                .long("rounds")
                .value_parser(value_parser!(u64))
                .help("Verify passes before stopping, 0 runs until killed (default: 10)"),
        )
        .arg(
            Arg::new("cleanup-only")
                .long("cleanup-only")
                .help("Drop every harness table on both stores and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("TOML config file"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_parser(value_parser!(u64))
                .help("Seed for workload randomness"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the run report as JSON")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .help("Log filter when RUST_LOG is unset"),
        )
}

/// Load the config file, if any, and apply flag overrides.
pub fn resolve_config(matches: &ArgMatches) -> Result<HarnessConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => HarnessConfig::from_file(path)?,
        None => {
            let local = Path::new(CONFIG_FILE_NAME);
            if local.is_file() {
                HarnessConfig::from_file(local)?
            } else {
                HarnessConfig::default()
            }
        }
    };

    if let Some(dsn) = matches.get_one::<String>("upstream") {
        config.upstream = dsn.clone();
    }
    if let Some(dsn) = matches.get_one::<String>("downstream") {
        config.downstream = dsn.clone();
    }
    if let Some(&accounts) = matches.get_one::<usize>("accounts") {
        config.accounts = accounts;
    }
    if let Some(&tables) = matches.get_one::<u32>("tables") {
        config.tables = tables;
    }
    if let Some(&concurrency) = matches.get_one::<usize>("concurrency") {
        config.concurrency = concurrency;
    }
    if let Some(&interval) = matches.get_one::<u64>("interval") {
        config.verify_interval_ms = interval;
    }
    if let Some(&rounds) = matches.get_one::<u64>("rounds") {
        config.rounds = rounds;
    }
    if matches.get_flag("cleanup-only") {
        config.cleanup_only = true;
    }
    if let Some(&seed) = matches.get_one::<u64>("seed") {
        config.seed = Some(seed);
    }

    config.validate()?;
    Ok(config)
}

/// Whether `err` came from bad arguments or configuration.
pub fn is_usage_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::Config(_)))
}
