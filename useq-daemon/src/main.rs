//! # USEQ Daemon
//!
//! Command-line entry point for the sequencing-run lifecycle daemon.
//!
//! - `useq daemons manage-runs` scans run roots and drives every run through
//!   conversion, transfer, cleanup and archive until interrupted.
//! - `useq daemons check-storage` only polls remote capacity and alerts on
//!   threshold edges.
//! - `useq runs ...` inspects and re-arms run records in the state store.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use useq_config::{ConfigLoad, ConfigLoader, DaemonConfig};
use useq_core::pipeline::{ConversionFlags, RunStatus};

mod commands;
mod wiring;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "useq")]
#[command(about = "Sequencing run lifecycle daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "USEQ_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before reading USEQ_* variables
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Long-running services
    #[command(subcommand)]
    Daemons(DaemonCommand),
    /// Inspect and repair run records
    #[command(subcommand)]
    Runs(RunsCommand),
}

#[derive(Debug, Subcommand)]
enum DaemonCommand {
    /// Scan run roots and process runs until interrupted
    ManageRuns(FlagArgs),
    /// Poll remote storage and alert on threshold crossings
    CheckStorage,
}

#[derive(Debug, Subcommand)]
enum RunsCommand {
    /// List tracked runs as JSON lines
    List {
        /// Only runs with this status (e.g. failed, converted)
        #[arg(long)]
        status: Option<RunStatus>,
    },
    /// Print one run record as JSON
    Status { run_id: String },
    /// Return a failed run to the status it failed from
    Rearm { run_id: String },
}

/// Conversion flags applied to runs registered by this invocation.
#[derive(ClapArgs, Debug, Clone, Default)]
struct FlagArgs {
    /// Convert even when some BCL files are missing
    #[arg(long)]
    allow_missing_bcl: bool,

    /// Barcode mismatches tolerated during demultiplexing (0-2)
    #[arg(long)]
    barcode_mismatches: Option<u8>,

    /// Also write index reads as FASTQ
    #[arg(long)]
    emit_index_fastq: bool,

    /// Keep reads shorter than the configured minimum
    #[arg(long)]
    relax_short_reads: bool,
}

impl FlagArgs {
    /// Command-line switches only ever turn options on; the mismatch count
    /// replaces the configured default when given.
    fn apply(&self, mut flags: ConversionFlags) -> ConversionFlags {
        flags.allow_missing_bcl |= self.allow_missing_bcl;
        flags.emit_index_fastq |= self.emit_index_fastq;
        flags.relax_short_reads |= self.relax_short_reads;
        if let Some(mismatches) = self.barcode_mismatches {
            flags.barcode_mismatches = mismatches;
        }
        flags
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Daemons(DaemonCommand::ManageRuns(flags)) => {
            let flags = flags.apply(config.conversion.default_flags);
            commands::manage_runs(config, flags).await
        }
        Command::Daemons(DaemonCommand::CheckStorage) => {
            commands::check_storage(config).await
        }
        Command::Runs(RunsCommand::List { status }) => {
            commands::list_runs(&config, status).await
        }
        Command::Runs(RunsCommand::Status { run_id }) => {
            commands::run_status(&config, &run_id).await
        }
        Command::Runs(RunsCommand::Rearm { run_id }) => {
            commands::rearm_run(&config, &run_id).await
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<DaemonConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path.clone());
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path.clone());
    }
    let ConfigLoad { config, warnings } =
        loader.load().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Stage and storage edges at info, per-event chatter off. Override via RUST_LOG.
                "info,pipeline::cycle=info,pipeline::stage=info,pipeline::scanner=info,storage::monitor=info,pipeline::events=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }

    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    Ok(config)
}
