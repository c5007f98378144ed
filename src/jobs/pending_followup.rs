//! Pending follow-up
//!
//! Flags transactions that have sat in Pending longer than the overdue window.
//! Each one is announced once; `follow_up_notified_at` records that it was.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter};

use crate::entities::{prelude::Transactions, transactions};
use crate::models::transaction::TransactionStatus;
use crate::services::notifier::{Notifier, TransactionEvent, TransactionEventKind};
use crate::services::reconciliation::upsert_transaction;

pub async fn run_pending_followup(
    db: &DatabaseConnection,
    notifier: &Notifier,
    overdue_after: Duration,
) -> Result<usize, DbErr> {
    check_overdue_at(db, notifier, overdue_after, Utc::now()).await
}

pub async fn check_overdue_at(
    db: &DatabaseConnection,
    notifier: &Notifier,
    overdue_after: Duration,
    now: DateTime<Utc>,
) -> Result<usize, DbErr> {
    let window = chrono::Duration::from_std(overdue_after).unwrap_or(chrono::Duration::MAX);
    let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

    let overdue = Transactions::find()
        .filter(transactions::Column::TransactionStatus.eq(TransactionStatus::Pending.as_str()))
        .filter(transactions::Column::FollowUpNotifiedAt.is_null())
        .filter(
            Condition::any()
                .add(transactions::Column::RequestDate.lt(cutoff))
                .add(
                    Condition::all()
                        .add(transactions::Column::RequestDate.is_null())
                        .add(transactions::Column::CreatedAt.lt(cutoff)),
                ),
        )
        .all(db)
        .await?;

    if overdue.is_empty() {
        return Ok(0);
    }

    tracing::info!("Found {} overdue pending transactions", overdue.len());

    let mut notified = 0;
    for mut row in overdue {
        let since = row.request_date.unwrap_or(row.created_at);
        row.follow_up_notified_at = Some(now);
        row.updated_at = now;

        upsert_transaction(db, row.clone(), &[transactions::Column::FollowUpNotifiedAt]).await?;

        notifier.publish(TransactionEvent {
            order_id: row.order_id.clone(),
            franchise: row.franchise_name.clone(),
            kind: TransactionEventKind::PendingOverdue,
            elapsed_secs: Some((now - since).num_seconds()),
            snapshot: row,
        });
        notified += 1;
    }

    Ok(notified)
}
