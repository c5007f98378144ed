//! Process-wide bearer token for the portal API
//!
//! The login response handler offers every token it sees; the cache only
//! accepts it when nothing is cached or the cached token is older than the
//! staleness threshold. Readers (transcript fetcher, backfill) never refresh.
//!
//! A token older than the maximum age is treated as absent wherever it comes
//! from, so a long-idle process never hands out an expired bearer token
//! loaded from the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, DbErr, EntityTrait, Set};
use tracing::{debug, info};

use crate::entities::{auth_tokens, prelude::AuthTokens};

const TOKEN_KEY: &str = "portal";

fn older_than(cached: &CachedToken, now: DateTime<Utc>, limit: Duration) -> bool {
    let age = now.signed_duration_since(cached.last_updated);
    match chrono::Duration::from_std(limit) {
        Ok(threshold) => age >= threshold,
        Err(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedToken {
    pub token: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuthTokenCache {
    db: DatabaseConnection,
    cache: Arc<Cache<&'static str, CachedToken>>,
    stale_after: Duration,
    max_age: Duration,
}

impl AuthTokenCache {
    pub fn new(db: DatabaseConnection, stale_after: Duration, max_age: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(1)
            .time_to_live(max_age)
            .build();

        Self {
            db,
            cache: Arc::new(cache),
            stale_after,
            max_age,
        }
    }

    /// Current token with its timestamp, falling back to the persisted row
    pub async fn current(&self) -> Result<Option<CachedToken>, DbErr> {
        self.current_at(Utc::now()).await
    }

    pub async fn current_at(&self, now: DateTime<Utc>) -> Result<Option<CachedToken>, DbErr> {
        if let Some(cached) = self.cache.get(TOKEN_KEY).await {
            if !self.is_expired(&cached, now) {
                return Ok(Some(cached));
            }
            self.cache.invalidate(TOKEN_KEY).await;
        }

        let stored = AuthTokens::find_by_id(TOKEN_KEY.to_string())
            .one(&self.db)
            .await?
            .map(|row| CachedToken {
                token: row.token,
                last_updated: row.last_updated,
            });

        match stored {
            Some(token) if self.is_expired(&token, now) => {
                debug!("Stored auth token expired (updated {})", token.last_updated);
                Ok(None)
            }
            Some(token) => {
                debug!("Loaded auth token from store (updated {})", token.last_updated);
                self.cache.insert(TOKEN_KEY, token.clone()).await;
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }

    pub async fn token(&self) -> Result<Option<String>, DbErr> {
        Ok(self.current().await?.map(|t| t.token))
    }

    pub fn is_stale(&self, cached: &CachedToken, now: DateTime<Utc>) -> bool {
        older_than(cached, now, self.stale_after)
    }

    pub fn is_expired(&self, cached: &CachedToken, now: DateTime<Utc>) -> bool {
        older_than(cached, now, self.max_age)
    }

    /// Offer a freshly observed token. Returns true when the cache was refreshed.
    pub async fn offer(&self, token: &str) -> Result<bool, DbErr> {
        self.offer_at(token, Utc::now()).await
    }

    pub async fn offer_at(&self, token: &str, now: DateTime<Utc>) -> Result<bool, DbErr> {
        if let Some(cached) = self.current_at(now).await? {
            if !self.is_stale(&cached, now) {
                debug!(
                    "Auth token still fresh (updated {}), ignoring login response",
                    cached.last_updated
                );
                return Ok(false);
            }
        }

        self.store(token, now).await?;
        info!("Auth token refreshed");
        Ok(true)
    }

    /// Unconditionally persist a token with the given timestamp
    pub async fn store(&self, token: &str, last_updated: DateTime<Utc>) -> Result<(), DbErr> {
        let row = auth_tokens::ActiveModel {
            key: Set(TOKEN_KEY.to_string()),
            token: Set(token.to_string()),
            last_updated: Set(last_updated),
        };

        AuthTokens::insert(row)
            .on_conflict(
                OnConflict::column(auth_tokens::Column::Key)
                    .update_columns([auth_tokens::Column::Token, auth_tokens::Column::LastUpdated])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        self.cache
            .insert(
                TOKEN_KEY,
                CachedToken {
                    token: token.to_string(),
                    last_updated,
                },
            )
            .await;

        Ok(())
    }
}
