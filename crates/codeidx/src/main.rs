//! codeidx - Artifact Storage CLI
//!
//! Operator tooling over the artifact storage engine:
//! - Inspect an artifact's meta, parts and record counts
//! - Validate a shard against its offsets sidecar
//! - Read rows by global index
//! - Print the resolved byte budget map

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;

mod cli;
mod config;

#[derive(Parser)]
#[command(name = "codeidx")]
#[command(author, version, about = "codeidx - artifact storage CLI", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path (TOML or JSON)
    #[arg(short, long, global = true, default_value = "codeidx.toml", env = "CODEIDX_CONFIG")]
    config: PathBuf,

    /// Log level for codeidx targets, overriding the configuration
    #[arg(long, global = true, env = "CODEIDX_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Describe an artifact
    Inspect {
        /// Artifact directory
        dir: PathBuf,
        /// Artifact name
        name: String,
    },

    /// Validate a JSONL shard against its offsets sidecar
    Validate {
        /// Row file
        jsonl: PathBuf,
        /// Offsets sidecar
        offsets: PathBuf,
    },

    /// Read rows by global index
    Read {
        /// Artifact directory
        dir: PathBuf,
        /// Artifact name
        name: String,
        /// Row indexes
        #[arg(required = true)]
        indexes: Vec<u64>,
        /// JSON array of file paths, for delta-encoded artifacts
        #[arg(long)]
        files: Option<PathBuf>,
    },

    /// Print resolved byte budgets
    Budgets,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = match &cli.command {
        Commands::Budgets => Some(config::load_required(&cli.config).await?),
        _ => config::load(&cli.config).await?,
    };
    let found = loaded.is_some();
    let mut config = loaded.unwrap_or_default();
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    codeidx_common::logging::init(&config.logging)?;
    if found {
        debug!("[config] loaded from {}", cli.config.display());
    } else {
        debug!("[config] {} not found, using defaults", cli.config.display());
    }

    match cli.command {
        Commands::Inspect { dir, name } => cli::inspect(&dir, &name, &config).await?,
        Commands::Validate { jsonl, offsets } => cli::validate(&jsonl, &offsets).await?,
        Commands::Read {
            dir,
            name,
            indexes,
            files,
        } => cli::read(&dir, &name, &indexes, files.as_ref(), &config).await?,
        Commands::Budgets => cli::budgets(&config)?,
    }

    Ok(())
}
