//! Persisted browser sessions keyed by operator identity
//!
//! A saved snapshot replaces the previous one for the same identity. Snapshots
//! idle for longer than the TTL are treated as absent and purged.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::entities::{prelude::Sessions, sessions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub cookies: Vec<StoredCookie>,
    pub local_storage: BTreeMap<String, String>,
    pub session_storage: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct SessionStore {
    db: DatabaseConnection,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(db: DatabaseConnection, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub async fn save(&self, identity: &str, snapshot: &SessionSnapshot) -> Result<(), DbErr> {
        self.save_at(identity, snapshot, Utc::now()).await
    }

    pub async fn save_at(
        &self,
        identity: &str,
        snapshot: &SessionSnapshot,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        let row = sessions::ActiveModel {
            identity: Set(identity.to_string()),
            cookies: Set(encode(&snapshot.cookies)?),
            local_storage: Set(encode(&snapshot.local_storage)?),
            session_storage: Set(encode(&snapshot.session_storage)?),
            last_used: Set(now),
            created_at: Set(now),
            ..Default::default()
        };

        Sessions::insert(row)
            .on_conflict(
                OnConflict::column(sessions::Column::Identity)
                    .update_columns([
                        sessions::Column::Cookies,
                        sessions::Column::LocalStorage,
                        sessions::Column::SessionStorage,
                        sessions::Column::LastUsed,
                        sessions::Column::CreatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        debug!(
            identity = %identity,
            cookies = snapshot.cookies.len(),
            "Saved browser session"
        );
        Ok(())
    }

    /// Load a live snapshot and mark it used. Expired snapshots are deleted.
    pub async fn load(&self, identity: &str) -> Result<Option<SessionSnapshot>, DbErr> {
        self.load_at(identity, Utc::now()).await
    }

    pub async fn load_at(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionSnapshot>, DbErr> {
        let Some(row) = Sessions::find()
            .filter(sessions::Column::Identity.eq(identity))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };

        if row.last_used < self.cutoff(now) {
            info!(identity = %identity, last_used = %row.last_used, "Discarding expired session");
            Sessions::delete_by_id(row.id).exec(&self.db).await?;
            return Ok(None);
        }

        let snapshot = match decode_row(&row) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Stored session is unreadable, discarding");
                Sessions::delete_by_id(row.id).exec(&self.db).await?;
                return Ok(None);
            }
        };

        Sessions::update_many()
            .col_expr(sessions::Column::LastUsed, sea_orm::sea_query::Expr::value(now))
            .filter(sessions::Column::Id.eq(row.id))
            .exec(&self.db)
            .await?;

        Ok(Some(snapshot))
    }

    pub async fn remove(&self, identity: &str) -> Result<(), DbErr> {
        Sessions::delete_many()
            .filter(sessions::Column::Identity.eq(identity))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Purge every session idle beyond the TTL. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64, DbErr> {
        self.purge_expired_at(Utc::now()).await
    }

    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<u64, DbErr> {
        let result = Sessions::delete_many()
            .filter(sessions::Column::LastUsed.lt(self.cutoff(now)))
            .exec(&self.db)
            .await?;

        if result.rows_affected > 0 {
            info!("Purged {} expired browser sessions", result.rows_affected);
        }
        Ok(result.rows_affected)
    }
}

fn decode_row(row: &sessions::Model) -> Result<SessionSnapshot, serde_json::Error> {
    Ok(SessionSnapshot {
        cookies: serde_json::from_str(&row.cookies)?,
        local_storage: serde_json::from_str(&row.local_storage)?,
        session_storage: serde_json::from_str(&row.session_storage)?,
    })
}

fn encode<T: Serialize>(value: &T) -> Result<String, DbErr> {
    serde_json::to_string(value).map_err(|e| DbErr::Custom(format!("session encode: {}", e)))
}
