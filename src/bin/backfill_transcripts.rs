use std::env;

use sea_orm::Database;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledger_sync::config::AppConfig;
use ledger_sync::jobs::transcript_backfill::{BACKFILL_BATCH, run_transcript_backfill};
use ledger_sync::services::auth_token_cache::AuthTokenCache;
use ledger_sync::services::transcript::TranscriptFetcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ledger_sync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Optional batch size from command line
    let limit = match env::args().nth(1) {
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            format!(
                "Invalid limit '{}'. Usage: cargo run --bin backfill_transcripts [limit]",
                raw
            )
        })?,
        None => BACKFILL_BATCH,
    };

    let config = AppConfig::from_env()?;

    tracing::info!("Connecting to database...");
    let db = Database::connect(&config.database_url).await?;

    let tokens = AuthTokenCache::new(db.clone(), config.token_stale_after, config.token_max_age);
    let fetcher = TranscriptFetcher::new(
        db,
        tokens,
        config.portal.api_base_url.clone(),
        config.portal.transcript_path.clone(),
    )?;

    tracing::info!("Starting transcript backfill (limit {})", limit);
    let report = run_transcript_backfill(&fetcher, limit).await?;

    tracing::info!(
        "Backfill complete: {} attached, {} not found, {} failed",
        report.attached,
        report.not_found,
        report.failed
    );

    Ok(())
}
