mod common;

use std::time::Duration;

use ledger_sync::config::AppConfig;
use ledger_sync::error::ScrapeError;
use ledger_sync::jobs::scheduler::RetryPolicy;
use ledger_sync::scrapers::browser::BrowserFactory;
use ledger_sync::scrapers::monitor::{Monitor, MonitorDeps, MonitorFleet, MonitorPhase};
use ledger_sync::services::auth_token_cache::AuthTokenCache;
use ledger_sync::services::notifier::Notifier;
use ledger_sync::services::reconciliation::ReconciliationEngine;
use ledger_sync::services::session_store::SessionStore;
use ledger_sync::services::transcript::TranscriptFetcher;

use crate::common::setup_test_db;

async fn create_config_and_deps() -> (AppConfig, MonitorDeps) {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let config = AppConfig::from_lookup(|name: &str| match name {
        "DATABASE_URL" => Some("sqlite::memory:".to_string()),
        "PORTAL_BASE_URL" => Some("https://portal.example.com".to_string()),
        "PORTAL_USERNAME" => Some("operator".to_string()),
        "PORTAL_PASSWORD" => Some("secret".to_string()),
        "MONITOR_CATEGORIES" => Some("deposit_pending,withdrawal_rejected".to_string()),
        _ => None,
    })
    .unwrap();

    let tokens = AuthTokenCache::new(db.clone(), config.token_stale_after, config.token_max_age);
    let transcripts = TranscriptFetcher::new(
        db.clone(),
        tokens.clone(),
        config.portal.api_base_url.clone(),
        config.portal.transcript_path.clone(),
    )
    .unwrap();

    let deps = MonitorDeps {
        portal: config.portal.clone(),
        factory: BrowserFactory::new(&config.portal),
        engine: ReconciliationEngine::new(db.clone(), Notifier::new(8)),
        tokens,
        sessions: SessionStore::new(db, config.session_ttl),
        transcripts,
    };

    (config, deps)
}

/// A scrape tick landing after shutdown must not bring a browser back
#[tokio::test]
async fn test_fleet_stays_down_after_shutdown() {
    let (config, deps) = create_config_and_deps().await;
    let fleet = MonitorFleet::new(&config.categories, deps);

    fleet.shutdown(Duration::from_secs(1)).await;

    let report = fleet
        .ensure_running(RetryPolicy::new(3, Duration::from_millis(10)))
        .await;
    assert!(report.started.is_empty());
    assert!(report.failed.is_empty());
    assert!(report.already_running.is_empty());
    assert_eq!(report.fatal, None);
    assert_eq!(
        report.stopped,
        vec!["deposit_pending".to_string(), "withdrawal_rejected".to_string()]
    );

    assert!(
        fleet
            .statuses()
            .iter()
            .all(|status| status.phase == MonitorPhase::Idle)
    );
}

#[tokio::test]
async fn test_start_after_stop_is_refused() {
    let (config, deps) = create_config_and_deps().await;
    let monitor = Monitor::new(config.categories[0].clone(), deps);

    monitor.stop().await;
    // Stopping twice is harmless
    monitor.stop().await;

    let result = monitor.start().await;
    assert!(matches!(result, Err(ScrapeError::Stopped(ref key)) if key == "deposit_pending"));
    assert_eq!(monitor.phase(), MonitorPhase::Idle);
}
