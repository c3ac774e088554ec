use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cmr_sync::RelayConfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "cmr")]
#[command(about = "Relay per-client metrics from the source store to the target store")]
struct Cli {
    /// Config file (YAML or JSON); falls back to CMR_CONFIG, then ./config.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract every configured client into one artifact per domain.
    Download,
    /// Load the artifacts into the target staging tables.
    Load,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = RelayConfig::from_env(cli.config).context("loading configuration")?;

    match cli.command {
        Commands::Download => {
            let summary = cmr_sync::run_download(&config)
                .await
                .context("data download failed")?;
            for (domain, records) in cmr_sync::counts_by_domain(&summary) {
                info!(%domain, records, "artifact ready");
            }
            info!(
                run_id = %summary.run_id,
                clients = summary.clients,
                records = summary.total_records(),
                "download complete"
            );
        }
        Commands::Load => {
            let summary = cmr_sync::run_load(&config).await.context("data load failed")?;
            for warning in &summary.warnings {
                info!(%warning, "skipped");
            }
            info!(
                run_id = %summary.run_id,
                rows = summary.rows_loaded(),
                skipped = summary.skipped().count(),
                post_processed = summary.post_processed,
                "load complete"
            );
        }
    }

    Ok(())
}
