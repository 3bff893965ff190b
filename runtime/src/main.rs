// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use harvest_runtime::cli;

#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Harvest: resilient report-viewer productivity collector",
    version,
    after_help = "Run 'harvest <command> --help' for details on each command."
)]
struct Cli {
    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest productivity rows and upsert them into the store
    Run(cli::run_cmd::RunArgs),
    /// Print the tasks a run would process
    Plan(cli::plan_cmd::PlanArgs),
    /// Check environment and diagnose issues
    Doctor,
    /// Prune expired screenshots and kill orphaned browsers
    Cleanup,
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set global flags via environment variables so all modules can check them
    if cli.json {
        std::env::set_var("HARVEST_JSON", "1");
    }
    if cli.quiet {
        std::env::set_var("HARVEST_QUIET", "1");
    }
    cli::init_logging(cli.json, cli.quiet, cli.verbose);

    let result = match cli.command {
        Commands::Run(args) => cli::run_cmd::run(&args).await,
        Commands::Plan(args) => cli::plan_cmd::run(&args).await,
        Commands::Doctor => cli::doctor::run().await,
        Commands::Cleanup => cli::cleanup_cmd::run().await,
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "harvest", &mut std::io::stdout());
            Ok(())
        }
    };

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        if cli::output::is_json() {
            cli::output::print_json(&serde_json::json!({
                "error": true,
                "message": format!("{e:#}"),
            }));
        } else if !cli::output::is_quiet() {
            eprintln!("  Error: {e:#}");
        }
        std::process::exit(1);
    }

    result
}
