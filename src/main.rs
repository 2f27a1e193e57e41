mod checkpoint;
mod cli;
mod config;
mod doctrine;
mod domain;
mod error;
mod extract;
mod llm;
mod memory;
mod minister;
mod nodes;
mod pipeline;
mod progress;
mod scoring;
mod segment;
mod store;
mod text;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Only warnings by default; RUST_LOG=info shows per-phase detail
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { path, fresh, workers } => {
            cli::commands::ingest::run(path, fresh, workers).await?;
        }
        Commands::Search { query, domain, topk } => {
            cli::commands::search::run(query, domain, topk).await?;
        }
        Commands::Stats => {
            cli::commands::stats::run().await?;
        }
    }

    Ok(())
}
