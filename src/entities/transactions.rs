//! `SeaORM` Entity for transactions table

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub order_id: String,
    pub kind: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub amount: Decimal,
    pub transaction_status: String,
    pub audit_status: String,
    pub request_date: Option<DateTimeUtc>,
    pub approved_on: Option<DateTimeUtc>,
    pub rejected_on: Option<DateTimeUtc>,
    pub checking_dept_approved_on: Option<DateTimeUtc>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub bonus_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub extra_bonus_amount: Decimal,
    pub bonus_approved_on: Option<DateTimeUtc>,
    pub is_image_available: bool,
    #[sea_orm(column_type = "Text", nullable)]
    pub transcript_link: Option<String>,
    pub last_transcript_update: Option<DateTimeUtc>,
    pub franchise_name: Option<String>,
    pub username: Option<String>,
    pub payment_method: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub remarks: Option<String>,
    pub follow_up_notified_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
