//! pqtor-bench orchestrator CLI
//!
//! Batch tool for the PQ-NTOR benchmark testbed: brings the fleet up, runs
//! a campaign plan to completion, brings it down, and exits.
//!
//! - `orchestrator run <plan.toml>`: execute a campaign
//! - `orchestrator teardown <fleet.toml>`: best-effort cleanup of leaked state
//! - `orchestrator summary <results.jsonl>`: recompute the summary table

mod commands;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pqb_core::config::FleetOverrides;

use crate::commands::{run_command, summary_command, teardown_command};

#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(author, version, about = "PQ-NTOR benchmark fleet orchestrator")]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// SSH username override for every fleet host
    #[arg(long, global = true, env = "PQB_SSH_USER")]
    ssh_user: Option<String>,

    /// SSH private key override for every fleet host
    #[arg(long, global = true, env = "PQB_SSH_KEY")]
    ssh_key: Option<PathBuf>,

    /// Shaped network interface override for every fleet host
    #[arg(long, global = true, env = "PQB_INTERFACE")]
    interface: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a campaign plan; exits 0 iff every scheduled iteration
    /// produced a record
    Run {
        /// Path to the campaign plan
        plan: PathBuf,
    },

    /// Best-effort cleanup of leaked processes and shaping on every fleet
    /// host
    Teardown {
        /// Path to the fleet file
        fleet: PathBuf,
    },

    /// Recompute the per-topology summary from a result log
    Summary {
        /// Path to a results.jsonl file
        log: PathBuf,
    },
}

impl Cli {
    fn overrides(&self) -> FleetOverrides {
        FleetOverrides {
            username: self.ssh_user.clone(),
            key_path: self.ssh_key.clone(),
            interface: self.interface.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match &cli.command {
        Commands::Run { plan } => run_command(plan, &cli.overrides()).await,
        Commands::Teardown { fleet } => teardown_command(fleet, &cli.overrides()).await,
        Commands::Summary { log } => summary_command(log),
    }
}
