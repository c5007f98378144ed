//! Reconciliation engine
//!
//! Maps scraped portal records onto the canonical `transactions` table and
//! upserts them by `order_id`. Derived timestamps (approved/rejected, audit
//! approval, bonus approval) are computed only from the delta between the
//! stored row and the incoming record, and once set they are never rewritten.
//!
//! Two monitors can see the same order at once (approved and rejected views
//! share one list endpoint). Updates are therefore conditional on the status
//! and image flag the decision was made from; the writer that loses re-reads
//! and decides again, so each transition fires its side effects once.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, IdenStatic, ModelTrait,
    QueryFilter, Set,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::entities::{agents, prelude::*, transactions};
use crate::error::{ReconcileError, RecordError};
use crate::models::transaction::{TransactionKind, TransactionStatus};
use crate::scrapers::{Category, ScrapedTransaction};
use crate::services::notifier::{Notifier, TransactionEvent, TransactionEventKind};

/// Columns a scrape is allowed to refresh. Transcript and follow-up columns
/// are owned by their own writers.
const SCRAPED_COLUMNS: [transactions::Column; 16] = [
    transactions::Column::Kind,
    transactions::Column::Amount,
    transactions::Column::TransactionStatus,
    transactions::Column::AuditStatus,
    transactions::Column::RequestDate,
    transactions::Column::ApprovedOn,
    transactions::Column::RejectedOn,
    transactions::Column::CheckingDeptApprovedOn,
    transactions::Column::BonusAmount,
    transactions::Column::ExtraBonusAmount,
    transactions::Column::BonusApprovedOn,
    transactions::Column::IsImageAvailable,
    transactions::Column::FranchiseName,
    transactions::Column::Username,
    transactions::Column::PaymentMethod,
    transactions::Column::Remarks,
];

/// Read-decide-write passes before giving up on a hot order
const MAX_WRITE_ATTEMPTS: usize = 3;

fn is_write_once(column: transactions::Column) -> bool {
    matches!(
        column,
        transactions::Column::ApprovedOn
            | transactions::Column::RejectedOn
            | transactions::Column::CheckingDeptApprovedOn
            | transactions::Column::BonusApprovedOn
    )
}

/// A scraped record mapped onto canonical field names
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingTransaction {
    pub order_id: String,
    pub kind: TransactionKind,
    /// Signed; `None` when the element carried no amount
    pub amount: Option<Decimal>,
    pub status: TransactionStatus,
    pub audit_status: Option<TransactionStatus>,
    pub request_date: Option<DateTime<Utc>>,
    pub approved_on: Option<DateTime<Utc>>,
    pub rejected_on: Option<DateTime<Utc>>,
    pub bonus_amount: Option<Decimal>,
    pub extra_bonus_amount: Option<Decimal>,
    pub is_image_available: bool,
    pub franchise_name: Option<String>,
    pub username: Option<String>,
    pub payment_method: Option<String>,
    pub remarks: Option<String>,
}

impl IncomingTransaction {
    pub fn from_scraped(record: ScrapedTransaction, category: &Category) -> Result<Self, RecordError> {
        let order_id = record
            .order_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(RecordError::MissingOrderId)?;
        let status = record.transaction_status.ok_or(RecordError::InvalidField {
            field: "transactionStatus",
            reason: "missing".to_string(),
        })?;

        Ok(Self {
            order_id,
            kind: category.kind,
            amount: record.amount.map(|amount| category.kind.signed_amount(amount)),
            status,
            audit_status: record.audit_status,
            request_date: record.request_date,
            approved_on: record.approved_on,
            rejected_on: record.rejected_on,
            bonus_amount: record.bonus_amount,
            extra_bonus_amount: record.extra_bonus_amount,
            is_image_available: record.is_image_available,
            franchise_name: record.franchise_name,
            username: record.username,
            payment_method: record.payment_method,
            remarks: record.remarks,
        })
    }
}

/// Everything computed from the delta between stored and incoming state
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFields {
    pub status: TransactionStatus,
    pub audit_status: TransactionStatus,
    pub approved_on: Option<DateTime<Utc>>,
    pub rejected_on: Option<DateTime<Utc>>,
    pub checking_dept_approved_on: Option<DateTime<Utc>>,
    pub bonus_approved_on: Option<DateTime<Utc>>,
    pub transcript_due: bool,
    /// Observed move of an existing row into Success or Rejected
    pub transition: Option<(TransactionStatus, TransactionStatus)>,
}

fn stored_status(raw: &str) -> Option<TransactionStatus> {
    raw.parse().ok()
}

/// Compute derived fields. Pure so the write-once rules can be tested
/// without a database.
pub fn derive_fields(
    existing: Option<&transactions::Model>,
    incoming: &IncomingTransaction,
    fetch_transcripts: bool,
    now: DateTime<Utc>,
) -> DerivedFields {
    let prev_status = existing.and_then(|m| stored_status(&m.transaction_status));
    let prev_audit = existing.and_then(|m| stored_status(&m.audit_status));

    // A stale view must not pull a settled transaction back to Pending
    let status = match prev_status {
        Some(prev) if prev.is_terminal() && !incoming.status.is_terminal() => prev,
        _ => incoming.status,
    };
    let audit_status = incoming
        .audit_status
        .or(prev_audit)
        .unwrap_or(TransactionStatus::Pending);

    let entered = |target: TransactionStatus| status == target && prev_status != Some(target);

    let approved_on = existing.and_then(|m| m.approved_on).or_else(|| {
        entered(TransactionStatus::Success).then(|| incoming.approved_on.unwrap_or(now))
    });
    let rejected_on = existing.and_then(|m| m.rejected_on).or_else(|| {
        entered(TransactionStatus::Rejected).then(|| incoming.rejected_on.unwrap_or(now))
    });

    let checking_dept_approved_on = existing.and_then(|m| m.checking_dept_approved_on).or_else(|| {
        (prev_audit == Some(TransactionStatus::Pending) && audit_status != TransactionStatus::Pending)
            .then_some(now)
    });

    let turned_on =
        |stored: Decimal, seen: Option<Decimal>| stored.is_zero() && seen.is_some_and(|v| !v.is_zero());
    let bonus_approved_on = existing.and_then(|m| m.bonus_approved_on).or_else(|| {
        existing
            .filter(|m| {
                turned_on(m.bonus_amount, incoming.bonus_amount)
                    || turned_on(m.extra_bonus_amount, incoming.extra_bonus_amount)
            })
            .map(|_| now)
    });

    let had_image = existing.is_some_and(|m| m.is_image_available);
    let transcript_due = fetch_transcripts && incoming.is_image_available && !had_image;

    let transition = prev_status
        .filter(|prev| *prev != status && status.is_terminal())
        .map(|prev| (prev, status));

    DerivedFields {
        status,
        audit_status,
        approved_on,
        rejected_on,
        checking_dept_approved_on,
        bonus_approved_on,
        transcript_due,
        transition,
    }
}

/// Row that should be stored after merging incoming state into the existing row.
/// Amounts missing from the element keep their stored value.
pub fn merge(
    existing: Option<&transactions::Model>,
    incoming: &IncomingTransaction,
    derived: &DerivedFields,
    now: DateTime<Utc>,
) -> transactions::Model {
    transactions::Model {
        order_id: incoming.order_id.clone(),
        kind: incoming.kind.as_str().to_string(),
        amount: incoming
            .amount
            .or_else(|| existing.map(|m| m.amount))
            .unwrap_or_default(),
        transaction_status: derived.status.as_str().to_string(),
        audit_status: derived.audit_status.as_str().to_string(),
        request_date: incoming
            .request_date
            .or_else(|| existing.and_then(|m| m.request_date)),
        approved_on: derived.approved_on,
        rejected_on: derived.rejected_on,
        checking_dept_approved_on: derived.checking_dept_approved_on,
        bonus_amount: incoming
            .bonus_amount
            .or_else(|| existing.map(|m| m.bonus_amount))
            .unwrap_or_default(),
        extra_bonus_amount: incoming
            .extra_bonus_amount
            .or_else(|| existing.map(|m| m.extra_bonus_amount))
            .unwrap_or_default(),
        bonus_approved_on: derived.bonus_approved_on,
        is_image_available: incoming.is_image_available,
        transcript_link: existing.and_then(|m| m.transcript_link.clone()),
        last_transcript_update: existing.and_then(|m| m.last_transcript_update),
        franchise_name: incoming
            .franchise_name
            .clone()
            .or_else(|| existing.and_then(|m| m.franchise_name.clone())),
        username: incoming
            .username
            .clone()
            .or_else(|| existing.and_then(|m| m.username.clone())),
        payment_method: incoming
            .payment_method
            .clone()
            .or_else(|| existing.and_then(|m| m.payment_method.clone())),
        remarks: incoming.remarks.clone(),
        follow_up_notified_at: existing.and_then(|m| m.follow_up_notified_at),
        created_at: existing.map(|m| m.created_at).unwrap_or(now),
        updated_at: existing.map(|m| m.updated_at).unwrap_or(now),
    }
}

fn into_active_model(model: transactions::Model) -> transactions::ActiveModel {
    transactions::ActiveModel {
        order_id: Set(model.order_id),
        kind: Set(model.kind),
        amount: Set(model.amount),
        transaction_status: Set(model.transaction_status),
        audit_status: Set(model.audit_status),
        request_date: Set(model.request_date),
        approved_on: Set(model.approved_on),
        rejected_on: Set(model.rejected_on),
        checking_dept_approved_on: Set(model.checking_dept_approved_on),
        bonus_amount: Set(model.bonus_amount),
        extra_bonus_amount: Set(model.extra_bonus_amount),
        bonus_approved_on: Set(model.bonus_approved_on),
        is_image_available: Set(model.is_image_available),
        transcript_link: Set(model.transcript_link),
        last_transcript_update: Set(model.last_transcript_update),
        franchise_name: Set(model.franchise_name),
        username: Set(model.username),
        payment_method: Set(model.payment_method),
        remarks: Set(model.remarks),
        follow_up_notified_at: Set(model.follow_up_notified_at),
        created_at: Set(model.created_at),
        updated_at: Set(model.updated_at),
    }
}

/// Upsert for writers that own a subset of columns (transcripts, follow-up).
///
/// Inserts the row if `order_id` is new, otherwise updates only `columns`
/// (plus `updated_at`). Write-once columns keep whatever value is already
/// stored.
pub async fn upsert_transaction<C>(
    db: &C,
    model: transactions::Model,
    columns: &[transactions::Column],
) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    let mut on_conflict = OnConflict::column(transactions::Column::OrderId);
    on_conflict.update_columns(
        columns
            .iter()
            .copied()
            .filter(|c| !is_write_once(*c))
            .chain(std::iter::once(transactions::Column::UpdatedAt)),
    );
    for column in columns.iter().copied().filter(|c| is_write_once(*c)) {
        let name = column.as_str();
        on_conflict.value(
            column,
            Expr::cust(format!("COALESCE(transactions.{name}, excluded.{name})")),
        );
    }

    Transactions::insert(into_active_model(model))
        .on_conflict(on_conflict)
        .exec_without_returning(db)
        .await?;

    Ok(())
}

/// Insert a first sighting. False when another writer inserted it first.
async fn insert_new<C>(db: &C, model: transactions::Model) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let inserted = Transactions::insert(into_active_model(model))
        .on_conflict(
            OnConflict::column(transactions::Column::OrderId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await;

    match inserted {
        Ok(rows) => Ok(rows == 1),
        Err(DbErr::RecordNotInserted) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Write `target` only if the row still has the status and image flag that
/// `prev` was read with. False when another writer changed either first.
async fn compare_and_update<C>(
    db: &C,
    prev: &transactions::Model,
    target: &transactions::Model,
) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let mut update = Transactions::update_many()
        .filter(transactions::Column::OrderId.eq(prev.order_id.as_str()))
        .filter(transactions::Column::TransactionStatus.eq(prev.transaction_status.as_str()))
        .filter(transactions::Column::IsImageAvailable.eq(prev.is_image_available));

    for column in SCRAPED_COLUMNS {
        let value = target.get(column);
        let expr = if is_write_once(column) {
            Expr::col(column).if_null(value)
        } else {
            Expr::value(value)
        };
        update = update.col_expr(column, expr);
    }

    let result = update
        .col_expr(transactions::Column::UpdatedAt, Expr::value(target.updated_at))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Inserted { order_id: String, transcript_due: bool },
    Updated { order_id: String, transcript_due: bool },
    Unchanged { order_id: String },
}

impl ReconcileOutcome {
    pub fn order_id(&self) -> &str {
        match self {
            ReconcileOutcome::Inserted { order_id, .. }
            | ReconcileOutcome::Updated { order_id, .. }
            | ReconcileOutcome::Unchanged { order_id } => order_id,
        }
    }

    pub fn transcript_due(&self) -> bool {
        match self {
            ReconcileOutcome::Inserted { transcript_due, .. }
            | ReconcileOutcome::Updated { transcript_due, .. } => *transcript_due,
            ReconcileOutcome::Unchanged { .. } => false,
        }
    }
}

/// Per-batch counters; a skipped record never aborts the batch
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub transcripts_due: Vec<String>,
}

impl BatchReport {
    pub fn upserted(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }

    fn record(&mut self, outcome: ReconcileOutcome) {
        if outcome.transcript_due() {
            self.transcripts_due.push(outcome.order_id().to_string());
        }
        match outcome {
            ReconcileOutcome::Inserted { .. } => self.inserted += 1,
            ReconcileOutcome::Updated { .. } => self.updated += 1,
            ReconcileOutcome::Unchanged { .. } => self.unchanged += 1,
        }
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    db: DatabaseConnection,
    notifier: Notifier,
}

impl ReconciliationEngine {
    pub fn new(db: DatabaseConnection, notifier: Notifier) -> Self {
        Self { db, notifier }
    }

    /// Merge one raw list element into the store
    pub async fn reconcile(
        &self,
        raw: &Value,
        category: &Category,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let scraped = ScrapedTransaction::from_value(raw)?;
        let incoming = IncomingTransaction::from_scraped(scraped, category)?;

        if let Some(franchise) = incoming.franchise_name.as_deref() {
            self.ensure_agent(franchise).await?;
        }

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            if let Some(outcome) = self.try_reconcile(&incoming, category).await? {
                return Ok(outcome);
            }
            debug!(
                order_id = %incoming.order_id,
                attempt,
                "Transaction changed concurrently, re-reading"
            );
        }

        Err(ReconcileError::Contended(incoming.order_id))
    }

    /// One read-decide-write pass. `None` when another writer got in between
    /// the read and the write.
    async fn try_reconcile(
        &self,
        incoming: &IncomingTransaction,
        category: &Category,
    ) -> Result<Option<ReconcileOutcome>, ReconcileError> {
        let existing = Transactions::find_by_id(incoming.order_id.clone())
            .one(&self.db)
            .await?;

        if existing.is_none() && incoming.amount.is_none() {
            return Err(RecordError::InvalidField {
                field: "amount",
                reason: "missing on first sighting".to_string(),
            }
            .into());
        }

        let now = Utc::now();
        let derived = derive_fields(existing.as_ref(), incoming, category.fetch_transcripts, now);
        let mut target = merge(existing.as_ref(), incoming, &derived, now);

        if existing.as_ref() == Some(&target) {
            return Ok(Some(ReconcileOutcome::Unchanged {
                order_id: incoming.order_id.clone(),
            }));
        }

        target.updated_at = now;
        let written = match &existing {
            None => insert_new(&self.db, target.clone()).await?,
            Some(prev) => compare_and_update(&self.db, prev, &target).await?,
        };
        if !written {
            return Ok(None);
        }

        if let Some((from, to)) = derived.transition {
            info!(
                order_id = %incoming.order_id,
                from = %from,
                to = %to,
                category = %category.key,
                "Transaction status changed"
            );
            self.notify_transition(from, to, target);
        }

        let order_id = incoming.order_id.clone();
        let transcript_due = derived.transcript_due;
        Ok(Some(match existing {
            None => {
                debug!(order_id = %order_id, category = %category.key, "Inserted transaction");
                ReconcileOutcome::Inserted {
                    order_id,
                    transcript_due,
                }
            }
            Some(_) => ReconcileOutcome::Updated {
                order_id,
                transcript_due,
            },
        }))
    }

    /// Reconcile every element of a list response, isolating failures per element
    pub async fn reconcile_batch(&self, records: &[Value], category: &Category) -> BatchReport {
        let mut report = BatchReport::default();

        for (index, raw) in records.iter().enumerate() {
            match self.reconcile(raw, category).await {
                Ok(outcome) => report.record(outcome),
                Err(ReconcileError::Record(e)) => {
                    warn!(category = %category.key, index, error = %e, "Skipping malformed record");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(category = %category.key, index, error = %e, "Failed to store record");
                    report.failed += 1;
                }
            }
        }

        info!(
            category = %category.key,
            total = records.len(),
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            failed = report.failed,
            "Reconciled batch"
        );

        report
    }

    /// Agents are create-once, keyed by franchise name
    async fn ensure_agent(&self, franchise: &str) -> Result<(), DbErr> {
        let existing = Agents::find()
            .filter(agents::Column::FranchiseName.eq(franchise))
            .one(&self.db)
            .await?;
        if existing.is_some() {
            return Ok(());
        }

        let agent = agents::ActiveModel {
            franchise_name: Set(franchise.to_string()),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        match Agents::insert(agent)
            .on_conflict(
                OnConflict::column(agents::Column::FranchiseName)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
        {
            Ok(_) | Err(DbErr::RecordNotInserted) => {
                info!(franchise = %franchise, "Registered new agent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn notify_transition(
        &self,
        from: TransactionStatus,
        to: TransactionStatus,
        snapshot: transactions::Model,
    ) {
        let stamp = match to {
            TransactionStatus::Success => snapshot.approved_on,
            TransactionStatus::Rejected => snapshot.rejected_on,
            TransactionStatus::Pending => None,
        };
        let elapsed_secs = stamp
            .zip(snapshot.request_date)
            .map(|(at, requested)| (at - requested).num_seconds());

        self.notifier.publish(TransactionEvent {
            order_id: snapshot.order_id.clone(),
            franchise: snapshot.franchise_name.clone(),
            kind: TransactionEventKind::StatusChanged {
                from: Some(from),
                to,
            },
            elapsed_secs,
            snapshot,
        });
    }
}
