//! Operator CLI (§4.12, §4.4): exception case management and hash-chain
//! verification against the same Postgres database the worker writes to.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use loanserve_storage::events::EventRepository;
use loanserve_storage::exceptions::ExceptionCaseRepository;

use crate::commands::{case, chain};
use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "loanserve")]
#[command(about = "LoanServe operator CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Exception case management
    Case {
        #[command(subcommand)]
        command: case::CaseCommand,
    },
    /// Hash-chain verification
    Chain {
        #[command(subcommand)]
        command: chain::ChainCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load()?;
    let pool = loanserve_storage::connect(&config.database_url, 5).await?;

    match cli.command {
        Commands::Case { command } => case::run(command, &ExceptionCaseRepository::new(pool)).await,
        Commands::Chain { command } => chain::run(command, &EventRepository::new(pool)).await,
    }
}
