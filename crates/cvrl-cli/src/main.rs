//! cvrl CLI
//!
//! Self-supervised pre-training and linear evaluation on CIFAR-10.
//!
//! # Commands
//!
//! - `pretrain`: Train a MoCo or SimCLR encoder without labels
//! - `linear`: Train a linear classifier on a frozen pre-trained encoder
//! - `inspect`: Report parameter counts and feature widths of a variant
//!
//! Exit code 0 on success, 1 on any error.

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

/// Contrastive visual representation learning
#[derive(Parser)]
#[command(name = "cvrl")]
#[command(version)]
#[command(about = "MoCo / SimCLR pre-training and linear evaluation")]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pre-train an encoder with a contrastive objective
    ///
    /// Writes pretrain_statistics.csv, a JSONL trajectory and the model
    /// checkpoint to the output directory after every epoch.
    Pretrain(commands::pretrain::PretrainArgs),
    /// Linear evaluation of a pre-trained encoder
    ///
    /// Writes linear_statistics.csv after every epoch and keeps the best
    /// classifier as linear_model.safetensors.
    Linear(commands::linear::LinearArgs),
    /// Print the size of a model variant
    Inspect(commands::inspect::InspectArgs),
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match cli.command {
        Commands::Pretrain(args) => commands::pretrain::handle_pretrain(args),
        Commands::Linear(args) => commands::linear::handle_linear(args),
        Commands::Inspect(args) => commands::inspect::handle_inspect(args),
    };

    std::process::exit(exit_code);
}
