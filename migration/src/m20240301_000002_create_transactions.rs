//! Canonical transaction store. Rows are never deleted.

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Transactions::Table)
                    .if_not_exists()
                    .col(string_len(Transactions::OrderId, 128).primary_key())
                    .col(string_len(Transactions::Kind, 16))
                    .col(decimal_len(Transactions::Amount, 16, 4))
                    .col(string_len(Transactions::TransactionStatus, 16))
                    .col(string_len(Transactions::AuditStatus, 16))
                    .col(timestamp_with_time_zone_null(Transactions::RequestDate))
                    .col(timestamp_with_time_zone_null(Transactions::ApprovedOn))
                    .col(timestamp_with_time_zone_null(Transactions::RejectedOn))
                    .col(timestamp_with_time_zone_null(Transactions::CheckingDeptApprovedOn))
                    .col(decimal_len(Transactions::BonusAmount, 16, 4).default(0))
                    .col(decimal_len(Transactions::ExtraBonusAmount, 16, 4).default(0))
                    .col(timestamp_with_time_zone_null(Transactions::BonusApprovedOn))
                    .col(boolean(Transactions::IsImageAvailable).default(false))
                    .col(text_null(Transactions::TranscriptLink))
                    .col(timestamp_with_time_zone_null(Transactions::LastTranscriptUpdate))
                    .col(string_null(Transactions::FranchiseName))
                    .col(string_null(Transactions::Username))
                    .col(string_null(Transactions::PaymentMethod))
                    .col(text_null(Transactions::Remarks))
                    .col(timestamp_with_time_zone_null(Transactions::FollowUpNotifiedAt))
                    .col(timestamp_with_time_zone(Transactions::CreatedAt))
                    .col(timestamp_with_time_zone(Transactions::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        // Pending follow-up and transcript backfill both scan by status
        manager
            .create_index(
                Index::create()
                    .name("idx_transactions_status")
                    .table(Transactions::Table)
                    .col(Transactions::TransactionStatus)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_transactions_franchise")
                    .table(Transactions::Table)
                    .col(Transactions::FranchiseName)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Transactions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Transactions {
    Table,
    OrderId,
    Kind,
    Amount,
    TransactionStatus,
    AuditStatus,
    RequestDate,
    ApprovedOn,
    RejectedOn,
    CheckingDeptApprovedOn,
    BonusAmount,
    ExtraBonusAmount,
    BonusApprovedOn,
    IsImageAvailable,
    TranscriptLink,
    LastTranscriptUpdate,
    FranchiseName,
    Username,
    PaymentMethod,
    Remarks,
    FollowUpNotifiedAt,
    CreatedAt,
    UpdatedAt,
}
