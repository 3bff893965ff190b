//! CLI subcommand implementations for the `harvest` binary.

pub mod cleanup_cmd;
pub mod doctor;
pub mod output;
pub mod plan_cmd;
pub mod run_cmd;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over the flag-derived
/// default. Logs go to stderr so `--json` output on stdout stays parseable.
pub fn init_logging(json: bool, quiet: bool, verbose: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("harvest={level},harvest_runtime={level}")));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("  logging already initialized: {e}");
    }
}
