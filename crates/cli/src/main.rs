//! Intentest CLI - Main Entry Point
//!
//! Runs natural-language browser tests and manages the replay cache.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod output;

use commands::{cache, run};

/// Intentest - natural-language end-to-end tests with cached replay
#[derive(Parser)]
#[command(name = "intentest")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "intentest.toml", global = true)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: run::RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests (the default when no command is given)
    Run(run::RunArgs),

    /// Manage the replay cache
    #[command(subcommand)]
    Cache(cache::CacheCommands),
}

#[tokio::main]
async fn main() -> ExitCode {
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

    let result = match cli.command {
        Some(Commands::Cache(cmd)) => cache::execute(cmd, &cli.config).await.map(|_| true),
        Some(Commands::Run(args)) => run::execute(args, &cli.config).await,
        None => run::execute(cli.run, &cli.config).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
