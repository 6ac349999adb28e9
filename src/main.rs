mod config;
mod engine;
mod error;
mod grid;
mod manager;
mod metrics;
mod model;
mod stats;
mod sweep;
mod utility;

use crate::manager::Manager;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    /// Directory holding `config.toml` and the simulation outputs.
    #[arg(long)]
    sim_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Perform a new run until convergence or the tick limit.
    Create,

    /// Run the `[sweep]` batch and export its tables.
    Sweep,

    /// Remove all generated outputs.
    Clean,
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(args.sim_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Create => mgr.create_run()?,
        Command::Sweep => mgr.sweep_sim()?,
        Command::Clean => mgr.clean_sim()?,
    }

    Ok(())
}
