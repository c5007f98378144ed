use std::time::Duration;

use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::MigratorTrait;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledger_sync::AppState;
use ledger_sync::config::AppConfig;
use ledger_sync::handlers::status;
use ledger_sync::jobs::pending_followup::run_pending_followup;
use ledger_sync::jobs::scheduler::{RetryPolicy, Scheduler};
use ledger_sync::jobs::scrape_cycle::run_scrape_cycle;
use ledger_sync::jobs::session_cleanup::run_session_cleanup;
use ledger_sync::jobs::transcript_backfill::run_backfill_job;
use ledger_sync::scrapers::browser::BrowserFactory;
use ledger_sync::scrapers::monitor::{MonitorDeps, MonitorFleet};
use ledger_sync::services::auth_token_cache::AuthTokenCache;
use ledger_sync::services::notifier::Notifier;
use ledger_sync::services::reconciliation::ReconciliationEngine;
use ledger_sync::services::session_store::SessionStore;
use ledger_sync::services::transcript::TranscriptFetcher;

const MONITOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ledger_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;

    // Fail fast when no browser can be found
    let factory = BrowserFactory::new(&config.portal);
    factory.verify()?;

    tracing::info!("Connecting to database...");
    let mut options = ConnectOptions::new(config.database_url.clone());
    options.sqlx_logging(false);
    let db = Database::connect(options).await?;

    tracing::info!("Running migrations...");
    migration::Migrator::up(&db, None).await?;

    let notifier = Notifier::default();
    let tokens = AuthTokenCache::new(db.clone(), config.token_stale_after, config.token_max_age);
    let sessions = SessionStore::new(db.clone(), config.session_ttl);
    let engine = ReconciliationEngine::new(db.clone(), notifier.clone());
    let transcripts = TranscriptFetcher::new(
        db.clone(),
        tokens.clone(),
        config.portal.api_base_url.clone(),
        config.portal.transcript_path.clone(),
    )?;

    let fleet = MonitorFleet::new(
        &config.categories,
        MonitorDeps {
            portal: config.portal.clone(),
            factory,
            engine,
            tokens,
            sessions: sessions.clone(),
            transcripts: transcripts.clone(),
        },
    );

    let schedule = config.schedule.clone();
    let retry = RetryPolicy::new(schedule.retry_max, schedule.retry_delay);
    let mut scheduler = Scheduler::new();

    {
        let fleet = fleet.clone();
        scheduler.spawn_job("scrape_cycle", schedule.scrape_interval, move || {
            let fleet = fleet.clone();
            async move { run_scrape_cycle(&fleet, retry).await }
        });
    }
    {
        let sessions = sessions.clone();
        scheduler.spawn_job(
            "session_cleanup",
            schedule.session_cleanup_interval,
            move || {
                let sessions = sessions.clone();
                async move { run_session_cleanup(&sessions).await }
            },
        );
    }
    {
        let db = db.clone();
        let notifier = notifier.clone();
        let overdue = schedule.pending_overdue;
        scheduler.spawn_job(
            "pending_followup",
            schedule.pending_check_interval,
            move || {
                let db = db.clone();
                let notifier = notifier.clone();
                async move {
                    run_pending_followup(&db, &notifier, overdue).await?;
                    Ok(())
                }
            },
        );
    }
    {
        let transcripts = transcripts.clone();
        scheduler.spawn_job(
            "transcript_backfill",
            schedule.backfill_interval,
            move || {
                let transcripts = transcripts.clone();
                async move { run_backfill_job(&transcripts).await }
            },
        );
    }

    let state = AppState {
        db,
        fleet: fleet.clone(),
        notifier,
    };
    let app = status::router(state);

    let listener = tokio::net::TcpListener::bind(config.status_bind_addr).await?;
    tracing::info!("Status server listening on {}", listener.local_addr()?);

    let mut stop = scheduler.shutdown_signal();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = stop.changed().await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!("Status server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, stopping scheduler");

    // Ticking stops first. A shut-down fleet refuses new starts, so an
    // in-flight scrape cycle drains while the scheduler waits on it.
    tokio::join!(scheduler.stop(), fleet.shutdown(MONITOR_SHUTDOWN_TIMEOUT));
    let _ = server.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
