//! gpusim CLI
//!
//! Command-line driver for the GPU cluster scheduling simulator.

mod commands;

use clap::{Parser, Subcommand};
use gpusim_core::SimConfig;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// gpusim - discrete-time simulator for GPU cluster job scheduling
#[derive(Parser, Debug)]
#[command(name = "gpusim")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive (overrides RUST_LOG and the config file)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulation and print its report
    Run {
        /// Scheduling policy (fifo, horus, horus+)
        #[arg(long)]
        schedule: Option<String>,

        /// Workload trace to replay instead of generating jobs
        #[arg(long)]
        trace_file: Option<PathBuf>,

        /// Maximum number of ticks to simulate
        #[arg(long)]
        ticks: Option<u64>,

        /// Seed for the synthetic workload generator
        #[arg(long)]
        seed: Option<u64>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Summarize a workload trace
    Trace {
        /// CSV trace file
        path: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_logging(cli: &Cli, config: &SimConfig) {
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if config.logging.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SimConfig::from_file(path)?,
        None => SimConfig::default(),
    };
    init_logging(&cli, &config);

    match cli.command {
        Commands::Run {
            schedule,
            trace_file,
            ticks,
            seed,
            json,
        } => {
            let overrides = commands::Overrides {
                schedule,
                trace_file,
                ticks,
                seed,
            };
            overrides.apply(&mut config)?;
            commands::run(&config, json)?;
        }
        Commands::Trace { path } => {
            commands::trace(&path)?;
        }
        Commands::Config => {
            commands::show_config(&config)?;
        }
    }

    Ok(())
}
