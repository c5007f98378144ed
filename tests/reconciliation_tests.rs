mod common;

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use sea_orm::{DatabaseConnection, EntityTrait, PaginatorTrait};
use serde_json::{Value, json};

use ledger_sync::entities::prelude::*;
use ledger_sync::entities::transactions;
use ledger_sync::models::transaction::TransactionStatus;
use ledger_sync::scrapers::Category;
use ledger_sync::services::notifier::{Notifier, TransactionEventKind};
use ledger_sync::services::reconciliation::{ReconcileOutcome, ReconciliationEngine};

use crate::common::setup_test_db;

async fn engine() -> (ReconciliationEngine, Notifier, DatabaseConnection) {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let notifier = Notifier::new(16);
    (
        ReconciliationEngine::new(db.clone(), notifier.clone()),
        notifier,
        db,
    )
}

fn deposits() -> Category {
    Category::by_key("deposit_pending").unwrap()
}

async fn stored(db: &DatabaseConnection, order_id: &str) -> transactions::Model {
    Transactions::find_by_id(order_id.to_string())
        .one(db)
        .await
        .unwrap()
        .expect("transaction should exist")
}

fn pending_x1() -> Value {
    json!({
        "orderID": "X1",
        "amount": 500,
        "transactionStatus": "Pending",
        "auditStatus": "Pending",
        "requestDate": "2024-01-01T09:00:00Z",
        "franchiseName": "North Star"
    })
}

/// Scenario A: pending → success stamps approvedOn once
#[tokio::test]
async fn test_approved_on_stamped_once() {
    let (engine, _, db) = engine().await;
    let category = deposits();

    let outcome = engine.reconcile(&pending_x1(), &category).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Inserted { .. }));

    let row = stored(&db, "X1").await;
    assert_eq!(row.transaction_status, "Pending");
    assert_eq!(row.amount, dec!(500));
    assert_eq!(row.approved_on, None);

    let mut success = pending_x1();
    success["transactionStatus"] = json!("Success");
    success["approvedOn"] = json!("2024-01-01T10:00:00Z");

    let outcome = engine.reconcile(&success, &category).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Updated { .. }));

    let expected = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let row = stored(&db, "X1").await;
    assert_eq!(row.transaction_status, "Success");
    assert_eq!(row.approved_on, Some(expected));

    let outcome = engine.reconcile(&success, &category).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Unchanged {
            order_id: "X1".to_string()
        }
    );
    assert_eq!(stored(&db, "X1").await.approved_on, Some(expected));

    // A later payload carrying a different approval time does not re-stamp
    success["approvedOn"] = json!("2024-01-02T10:00:00Z");
    engine.reconcile(&success, &category).await.unwrap();
    assert_eq!(stored(&db, "X1").await.approved_on, Some(expected));
}

#[tokio::test]
async fn test_same_payload_twice_is_idempotent() {
    let (engine, _, db) = engine().await;
    let category = deposits();

    engine.reconcile(&pending_x1(), &category).await.unwrap();
    let first = stored(&db, "X1").await;

    let outcome = engine.reconcile(&pending_x1(), &category).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Unchanged { .. }));
    assert_eq!(stored(&db, "X1").await, first);
}

/// Scenario C: one malformed element does not abort the batch
#[tokio::test]
async fn test_malformed_record_is_skipped() {
    let (engine, _, db) = engine().await;

    let records: Vec<Value> = vec![
        json!({"orderID": "B1", "amount": 10, "transactionStatus": "Pending"}),
        json!({"orderID": "B2", "amount": 20, "transactionStatus": "Pending"}),
        json!({"amount": 30, "transactionStatus": "Pending"}),
        json!({"orderID": "B4", "amount": "40.5", "transactionStatus": "Success"}),
        json!({"orderID": 5, "amount": 50, "transactionStatus": "Rejected"}),
    ];

    let report = engine.reconcile_batch(&records, &deposits()).await;
    assert_eq!(report.upserted(), 4);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(Transactions::find().count(&db).await.unwrap(), 4);
    assert_eq!(stored(&db, "B4").await.amount, dec!(40.5));
    assert_eq!(stored(&db, "5").await.transaction_status, "Rejected");
}

#[tokio::test]
async fn test_list_payload_wrappers() {
    let (engine, _, db) = engine().await;
    let category = deposits();

    for payload in [
        json!([{"orderID": "W1", "amount": 1, "transactionStatus": "Pending"}]),
        json!({"data": [{"orderID": "W2", "amount": 1, "transactionStatus": "Pending"}]}),
        json!({"rows": [{"orderID": "W3", "amount": 1, "transactionStatus": "Pending"}]}),
    ] {
        let records = ledger_sync::scrapers::parser::extract_records(payload).unwrap();
        engine.reconcile_batch(&records, &category).await;
    }

    assert_eq!(Transactions::find().count(&db).await.unwrap(), 3);
}

#[tokio::test]
async fn test_bonus_approved_on() {
    let (engine, _, db) = engine().await;
    let category = deposits();

    let mut record = pending_x1();
    engine.reconcile(&record, &category).await.unwrap();
    engine.reconcile(&record, &category).await.unwrap();
    assert_eq!(stored(&db, "X1").await.bonus_approved_on, None);

    record["bonus"] = json!(25);
    engine.reconcile(&record, &category).await.unwrap();
    let stamped = stored(&db, "X1").await.bonus_approved_on;
    assert!(stamped.is_some());

    // Staying non-zero, or a second bonus field turning on, keeps the first stamp
    record["extraBonus"] = json!(5);
    engine.reconcile(&record, &category).await.unwrap();
    assert_eq!(stored(&db, "X1").await.bonus_approved_on, stamped);
}

#[tokio::test]
async fn test_audit_approval_stamp() {
    let (engine, _, db) = engine().await;
    let category = deposits();

    let mut record = pending_x1();
    engine.reconcile(&record, &category).await.unwrap();
    assert_eq!(stored(&db, "X1").await.checking_dept_approved_on, None);

    record["auditStatus"] = json!("Success");
    engine.reconcile(&record, &category).await.unwrap();
    let stamped = stored(&db, "X1").await.checking_dept_approved_on;
    assert!(stamped.is_some());

    record["auditStatus"] = json!("Rejected");
    engine.reconcile(&record, &category).await.unwrap();
    assert_eq!(stored(&db, "X1").await.checking_dept_approved_on, stamped);
}

#[tokio::test]
async fn test_transcript_due_once_per_image_flip() {
    let (engine, _, _db) = engine().await;
    let category = deposits();

    let mut record = pending_x1();
    let outcome = engine.reconcile(&record, &category).await.unwrap();
    assert!(!outcome.transcript_due());

    record["isImageAvailable"] = json!(true);
    let outcome = engine.reconcile(&record, &category).await.unwrap();
    assert!(outcome.transcript_due());

    record["remarks"] = json!("checked");
    let outcome = engine.reconcile(&record, &category).await.unwrap();
    assert!(!outcome.transcript_due());

    // Withdrawal categories never fetch transcripts
    let withdrawals = Category::by_key("withdrawal_pending").unwrap();
    let record = json!({"orderID": "W9", "amount": 80, "transactionStatus": "Pending", "isImageAvailable": 1});
    let outcome = engine.reconcile(&record, &withdrawals).await.unwrap();
    assert!(!outcome.transcript_due());
}

#[tokio::test]
async fn test_terminal_status_not_regressed() {
    let (engine, _, db) = engine().await;

    let mut record = pending_x1();
    record["transactionStatus"] = json!("Success");
    engine.reconcile(&record, &deposits()).await.unwrap();

    // A pending view rendered just before the flip arrives late
    record["transactionStatus"] = json!("Pending");
    record["remarks"] = json!("late");
    engine.reconcile(&record, &deposits()).await.unwrap();

    let row = stored(&db, "X1").await;
    assert_eq!(row.transaction_status, "Success");
    assert_eq!(row.remarks.as_deref(), Some("late"));
}

#[tokio::test]
async fn test_withdrawals_are_negative_and_agents_created() {
    let (engine, _, db) = engine().await;
    let withdrawals = Category::by_key("withdrawal_pending").unwrap();

    let record = json!({
        "orderID": "W1",
        "amount": 120,
        "transactionStatus": "Pending",
        "franchiseName": "South Bay"
    });
    engine.reconcile(&record, &withdrawals).await.unwrap();
    engine.reconcile(&pending_x1(), &deposits()).await.unwrap();
    engine.reconcile(&record, &withdrawals).await.unwrap();

    let row = stored(&db, "W1").await;
    assert_eq!(row.amount, dec!(-120));
    assert_eq!(row.kind, "withdrawal");
    assert_eq!(Agents::find().count(&db).await.unwrap(), 2);
}

#[tokio::test]
async fn test_status_change_is_published() {
    let (engine, notifier, _db) = engine().await;
    let mut events = notifier.subscribe();
    let category = deposits();

    engine.reconcile(&pending_x1(), &category).await.unwrap();

    let mut rejected = pending_x1();
    rejected["transactionStatus"] = json!("Rejected");
    rejected["rejectedOn"] = json!("2024-01-01T09:30:00Z");
    engine.reconcile(&rejected, &category).await.unwrap();

    let event = events.try_recv().expect("status change should be published");
    assert_eq!(event.order_id, "X1");
    assert_eq!(event.franchise.as_deref(), Some("North Star"));
    assert_eq!(
        event.kind,
        TransactionEventKind::StatusChanged {
            from: Some(TransactionStatus::Pending),
            to: TransactionStatus::Rejected,
        }
    );
    assert_eq!(event.elapsed_secs, Some(30 * 60));

    // Nothing further for a repeat of the same state
    engine.reconcile(&rejected, &category).await.unwrap();
    assert!(events.try_recv().is_err());
}

/// Approved and rejected deposit monitors share a list endpoint, so the same
/// flip routinely arrives twice at once
#[tokio::test]
async fn test_concurrent_flip_fires_side_effects_once() {
    let (engine, notifier, db) = engine().await;
    let approved = Category::by_key("deposit_approved").unwrap();
    let rejected = Category::by_key("deposit_rejected").unwrap();

    engine.reconcile(&pending_x1(), &deposits()).await.unwrap();
    let mut events = notifier.subscribe();

    let mut flipped = pending_x1();
    flipped["transactionStatus"] = json!("Success");
    flipped["approvedOn"] = json!("2024-01-01T10:00:00Z");
    flipped["isImageAvailable"] = json!(true);

    let (a, b) = tokio::join!(
        engine.reconcile(&flipped, &approved),
        engine.reconcile(&flipped, &rejected)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let due = [a.transcript_due(), b.transcript_due()];
    assert_eq!(due.iter().filter(|d| **d).count(), 1, "outcomes: {:?} {:?}", a, b);

    assert!(events.try_recv().is_ok());
    assert!(events.try_recv().is_err(), "status change published twice");

    let row = stored(&db, "X1").await;
    assert_eq!(row.transaction_status, "Success");
    assert!(row.is_image_available);
}

#[tokio::test]
async fn test_concurrent_first_sighting_inserts_once() {
    let (engine, _, db) = engine().await;
    let approved = Category::by_key("deposit_approved").unwrap();
    let rejected = Category::by_key("deposit_rejected").unwrap();

    let mut record = pending_x1();
    record["isImageAvailable"] = json!(true);

    let (a, b) = tokio::join!(
        engine.reconcile(&record, &approved),
        engine.reconcile(&record, &rejected)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let inserted = [&a, &b]
        .iter()
        .filter(|o| matches!(o, ReconcileOutcome::Inserted { .. }))
        .count();
    assert_eq!(inserted, 1);
    assert_eq!(
        [a.transcript_due(), b.transcript_due()].iter().filter(|d| **d).count(),
        1
    );
    assert_eq!(Transactions::find().count(&db).await.unwrap(), 1);
}

#[tokio::test]
async fn test_sparse_redelivery_keeps_amounts() {
    let (engine, _, db) = engine().await;
    let category = deposits();

    let mut record = pending_x1();
    record["bonus"] = json!("12.50");
    engine.reconcile(&record, &category).await.unwrap();

    // Same order again, this time without any amount fields
    let sparse = json!({
        "orderID": "X1",
        "transactionStatus": "Pending",
        "amount": null,
        "remarks": "sparse"
    });
    engine.reconcile(&sparse, &category).await.unwrap();

    let row = stored(&db, "X1").await;
    assert_eq!(row.amount, dec!(500));
    assert_eq!(row.bonus_amount, dec!(12.5));
    assert_eq!(row.remarks.as_deref(), Some("sparse"));
}

#[tokio::test]
async fn test_first_sighting_without_amount_is_skipped() {
    let (engine, _, db) = engine().await;

    let records = vec![
        json!({"orderID": "N1", "transactionStatus": "Pending"}),
        json!({"orderID": "N2", "amount": "", "transactionStatus": "Pending"}),
        json!({"orderID": "N3", "amount": 15, "transactionStatus": "Pending"}),
    ];
    let report = engine.reconcile_batch(&records, &deposits()).await;

    assert_eq!(report.skipped, 2);
    assert_eq!(report.inserted, 1);
    assert_eq!(Transactions::find().count(&db).await.unwrap(), 1);
}
