//! Convert the raw CSV output of all chains of one model into `.npy` arrays.
//!
//! The database root is taken from `POSTERIORDB_PATH`, log verbosity from
//! `RUST_LOG`.

use anyhow::{Context, Result};
use clap::Parser;
use posterior_bridge::{ingest::ingest_model, DatabaseConfig, IngestSettings};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Convert multi-chain sampler output into reference draw arrays")]
struct Cli {
    /// Model number in the posterior database
    model: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DatabaseConfig::from_env()?;
    let files = config.model_files(cli.model);
    let settings = IngestSettings::default();

    let draws = ingest_model(&files, &settings)
        .with_context(|| format!("Failed to ingest draws of model {}", cli.model))?;

    tracing::info!(
        parameters = ?draws.parameter_names,
        diagnostics = ?draws.diagnostic_names,
        "column split"
    );
    Ok(())
}
