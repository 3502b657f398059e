//! # TVL Pipeline Service
//!
//! Long-running service that reconciles hourly balances, supplies, prices and
//! value reports for every configured chain.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin pipeline
//! ```
//!
//! Press Ctrl+C to stop gracefully.

use anyhow::Result;
use clap::Parser;
use tvl_pipeline_sdk::{database, metrics, orchestrator::Orchestrator, settings::Settings};

#[derive(Parser, Debug)]
#[command(name = "pipeline", about = "Hourly TVL reconciliation pipeline")]
struct Args {
    /// Override the configured minimum backfill timestamp (unix seconds).
    #[arg(long)]
    min_timestamp: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();
    let mut settings = Settings::new()?;
    if let Some(min_timestamp) = args.min_timestamp {
        settings.min_timestamp = min_timestamp;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log.level.clone()),
    )
    .init();

    log::info!("🚀 Starting TVL pipeline");
    log::info!("   Chains: {}", settings.chains.len());
    log::info!("   Backfill from: {}", settings.min_timestamp());

    metrics::describe_metrics();
    if settings.metrics.enabled {
        metrics::install_exporter(settings.metrics.port)?;
        log::info!("   Metrics on port {}", settings.metrics.port);
    }

    let db_pool = database::connect(&settings.database.url).await?;

    let orchestrator = Orchestrator::new(settings, db_pool)?;
    let handles = orchestrator.start().await?;
    log::info!("✅ Pipeline running ({} clock subscriptions)", handles.len());

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down.");
    for handle in handles {
        handle.unsubscribe();
    }
    Ok(())
}
