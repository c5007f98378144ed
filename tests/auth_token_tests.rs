mod common;

use std::time::Duration;

use chrono::{TimeZone, Utc};

use ledger_sync::services::auth_token_cache::AuthTokenCache;

use crate::common::setup_test_db;

const STALE_AFTER: Duration = Duration::from_secs(5 * 3600 + 40 * 60);
const MAX_AGE: Duration = Duration::from_secs(86_400);

/// Scenario B: a 6h old token is replaced, a fresh one is kept
#[tokio::test]
async fn test_refresh_only_when_stale() {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let cache = AuthTokenCache::new(db, STALE_AFTER, MAX_AGE);

    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    cache
        .store("old-token", now - chrono::Duration::hours(6))
        .await
        .unwrap();

    assert!(cache.offer_at("new-token", now).await.unwrap());
    let current = cache.current_at(now).await.unwrap().unwrap();
    assert_eq!(current.token, "new-token");
    assert_eq!(current.last_updated, now);

    let later = now + chrono::Duration::minutes(10);
    assert!(!cache.offer_at("newer-token", later).await.unwrap());
    let current = cache.current_at(later).await.unwrap().unwrap();
    assert_eq!(current.token, "new-token");
    assert_eq!(current.last_updated, now);
}

#[tokio::test]
async fn test_empty_cache_accepts_first_token() {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let cache = AuthTokenCache::new(db, STALE_AFTER, MAX_AGE);

    assert_eq!(cache.token().await.unwrap(), None);
    assert!(cache.offer("first").await.unwrap());
    assert_eq!(cache.token().await.unwrap().as_deref(), Some("first"));
}

#[tokio::test]
async fn test_token_survives_restart() {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let cache = AuthTokenCache::new(db.clone(), STALE_AFTER, MAX_AGE);
    cache.offer("persisted").await.unwrap();

    // A fresh cache over the same store reads the persisted row
    let restarted = AuthTokenCache::new(db, STALE_AFTER, MAX_AGE);
    assert_eq!(restarted.token().await.unwrap().as_deref(), Some("persisted"));
    assert!(!restarted.offer("other").await.unwrap());
}

#[tokio::test]
async fn test_expired_store_row_is_not_served() {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    let writer = AuthTokenCache::new(db.clone(), STALE_AFTER, MAX_AGE);
    writer
        .store("ancient", now - chrono::Duration::hours(25))
        .await
        .unwrap();

    // A restarted process must not load it back from the store either
    let restarted = AuthTokenCache::new(db, STALE_AFTER, MAX_AGE);
    assert_eq!(restarted.current_at(now).await.unwrap(), None);

    assert!(restarted.offer_at("fresh", now).await.unwrap());
    let current = restarted.current_at(now).await.unwrap().unwrap();
    assert_eq!(current.token, "fresh");
}

#[tokio::test]
async fn test_cached_token_expires_in_process() {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let cache = AuthTokenCache::new(db, STALE_AFTER, MAX_AGE);

    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    cache.store("today", now).await.unwrap();
    assert!(cache.current_at(now).await.unwrap().is_some());

    let next_day = now + chrono::Duration::hours(24);
    assert_eq!(cache.current_at(next_day).await.unwrap(), None);
}
