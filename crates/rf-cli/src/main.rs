//! rarefit CLI

mod toy;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rarefit")]
#[command(about = "rarefit - extended unbinned likelihood fits and limits")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a peak-on-flat toy, fit it and set a limit on the signal rate
    Toy {
        /// Toy configuration (JSON). Missing fields take their defaults.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Simulation seed. Overrides the config.
        #[arg(long)]
        seed: Option<u64>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Toy { config, seed, output } => cmd_toy(config.as_ref(), seed, output.as_ref()),
    }
}

fn cmd_toy(config: Option<&PathBuf>, seed: Option<u64>, output: Option<&PathBuf>) -> Result<()> {
    let mut cfg = match config {
        Some(path) => toy::ToyConfig::load(path)?,
        None => toy::ToyConfig::default(),
    };
    if let Some(seed) = seed {
        cfg.seed = seed;
    }
    let report = toy::run(&cfg)?;
    write_json(output, serde_json::to_value(&report)?)
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
