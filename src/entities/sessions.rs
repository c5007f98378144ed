//! `SeaORM` Entity for sessions table
//!
//! Cookie and storage snapshots are stored as JSON text.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub identity: String,
    #[sea_orm(column_type = "Text")]
    pub cookies: String,
    #[sea_orm(column_type = "Text")]
    pub local_storage: String,
    #[sea_orm(column_type = "Text")]
    pub session_storage: String,
    pub last_used: DateTimeUtc,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
