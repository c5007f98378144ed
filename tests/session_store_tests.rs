mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use sea_orm::{EntityTrait, PaginatorTrait};

use ledger_sync::entities::prelude::Sessions;
use ledger_sync::services::session_store::{SessionSnapshot, SessionStore, StoredCookie};

use crate::common::setup_test_db;

const TTL: Duration = Duration::from_secs(24 * 3600);

fn snapshot(value: &str) -> SessionSnapshot {
    let mut local_storage = BTreeMap::new();
    local_storage.insert("auth".to_string(), value.to_string());

    SessionSnapshot {
        cookies: vec![StoredCookie {
            name: "sid".to_string(),
            value: value.to_string(),
            domain: "portal.example.com".to_string(),
            path: "/".to_string(),
            secure: true,
            http_only: true,
        }],
        local_storage,
        session_storage: BTreeMap::new(),
    }
}

#[tokio::test]
async fn test_newer_save_supersedes() {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let store = SessionStore::new(db.clone(), TTL);
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    store.save_at("operator", &snapshot("one"), now).await.unwrap();
    store
        .save_at("operator", &snapshot("two"), now + chrono::Duration::minutes(5))
        .await
        .unwrap();

    let loaded = store
        .load_at("operator", now + chrono::Duration::minutes(6))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, snapshot("two"));
    assert_eq!(Sessions::find().count(&db).await.unwrap(), 1);
}

#[tokio::test]
async fn test_expired_session_is_discarded() {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let store = SessionStore::new(db.clone(), TTL);
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    store.save_at("operator", &snapshot("one"), now).await.unwrap();

    let later = now + chrono::Duration::hours(25);
    assert_eq!(store.load_at("operator", later).await.unwrap(), None);
    assert_eq!(Sessions::find().count(&db).await.unwrap(), 0);
}

#[tokio::test]
async fn test_load_extends_lifetime() {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let store = SessionStore::new(db, TTL);
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    store.save_at("operator", &snapshot("one"), now).await.unwrap();
    assert!(
        store
            .load_at("operator", now + chrono::Duration::hours(20))
            .await
            .unwrap()
            .is_some()
    );
    // 40h after the save but only 20h after the last use
    assert!(
        store
            .load_at("operator", now + chrono::Duration::hours(40))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_purge_expired() {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let store = SessionStore::new(db.clone(), TTL);
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    store
        .save_at("stale", &snapshot("a"), now - chrono::Duration::hours(30))
        .await
        .unwrap();
    store.save_at("fresh", &snapshot("b"), now).await.unwrap();

    assert_eq!(store.purge_expired_at(now).await.unwrap(), 1);
    assert_eq!(Sessions::find().count(&db).await.unwrap(), 1);
    assert!(store.load_at("fresh", now).await.unwrap().is_some());

    store.remove("fresh").await.unwrap();
    assert_eq!(Sessions::find().count(&db).await.unwrap(), 0);
}
