//! Uplink Agent
//!
//! Watches output folders, ships new files to object storage, purges old
//! data under memory pressure and serves a small HTTP control surface.

mod commands;
mod handlers;
mod logging;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "uplink")]
#[command(author, version, about = "Uplink - edge upload and purge agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted
    Run,

    /// Print the resolved settings and exit
    #[command(name = "check-config")]
    CheckConfig,
}

#[tokio::main]
async fn main() {
    logging::install_panic_hook();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run => commands::run::execute(cli.config.as_deref(), cli.verbose).await,
        Commands::CheckConfig => commands::check_config::execute(cli.config.as_deref()),
    };

    if let Err(e) = result {
        tracing::error!("Command failed: {:#}", e);
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
