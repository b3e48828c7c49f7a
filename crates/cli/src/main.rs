//! TestPilot CLI - Main Entry Point
//!
//! Runs the unit, E2E and smoke crawl phases against the application
//! under test and exits with the run's exit code.

use clap::Parser;
use std::path::PathBuf;
use testpilot_common::{Mode, PhaseKind};
use testpilot_harness::{HarnessConfig, RunOptions};
use tokio_util::sync::CancellationToken;
use tracing::warn;

mod output;
mod setup;

/// TestPilot - autonomous test harness
#[derive(Parser, Debug)]
#[command(name = "testpilot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Harness configuration file
    #[arg(long, default_value = "testpilot.toml")]
    config: PathBuf,

    /// Target environment (local or remote); falls back to TEST_MODE, then the config file
    #[arg(long)]
    mode: Option<Mode>,

    /// Skip the unit test phase
    #[arg(long)]
    skip_unit: bool,

    /// Skip the E2E phase
    #[arg(long)]
    skip_e2e: bool,

    /// Skip the smoke crawl phase
    #[arg(long)]
    skip_smoke: bool,

    /// Leave the database as it is
    #[arg(long)]
    skip_db_reset: bool,

    /// Run only this phase (unit, e2e, smoke)
    #[arg(long, value_name = "NAME")]
    phase: Option<PhaseKind>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            skip_unit: self.skip_unit,
            skip_e2e: self.skip_e2e,
            skip_smoke: self.skip_smoke,
            skip_db_reset: self.skip_db_reset,
            only: self.phase,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let config = match HarnessConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            output::print_error(&format!("Cannot load {}: {}", cli.config.display(), e));
            std::process::exit(e.exit_code().code());
        }
    };

    let options = cli.run_options();
    let orchestrator = setup::build(&config, cli.mode, &options).await;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    let run = orchestrator.run(&options, &cancel).await;
    output::print_summary(&run, &config.report_dir());

    std::process::exit(run.exit_code.code());
}
