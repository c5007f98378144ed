//! Transcript fetcher
//!
//! Pulls the transcript image for an order from the portal API using the
//! cached bearer token and attaches it to the stored transaction.
//!
//! Every answer from upstream stamps `last_transcript_update`, including a
//! 404, so the backfill works through never-tried orders before retrying
//! ones the portal has already turned down.

use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use reqwest::{Client, StatusCode, Url, header};
use sea_orm::sea_query::{Expr, NullOrdering, Order};
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::entities::{prelude::Transactions, transactions};
use crate::services::auth_token_cache::AuthTokenCache;
use crate::services::reconciliation::upsert_transaction;

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptOutcome {
    Attached,
    NotFound,
    Failed(String),
}

#[derive(Clone)]
pub struct TranscriptFetcher {
    client: Client,
    db: DatabaseConnection,
    tokens: AuthTokenCache,
    api_base_url: String,
    /// Path template containing `{orderId}`
    path_template: String,
}

impl TranscriptFetcher {
    pub fn new(
        db: DatabaseConnection,
        tokens: AuthTokenCache,
        api_base_url: String,
        path_template: String,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            db,
            tokens,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            path_template,
        })
    }

    pub fn tokens(&self) -> &AuthTokenCache {
        &self.tokens
    }

    fn url_for(&self, order_id: &str) -> Result<Url, String> {
        transcript_url(&self.api_base_url, &self.path_template, order_id)
    }

    /// Fetch using whatever token is cached right now
    pub async fn fetch_with_cached_token(&self, order_id: &str) -> TranscriptOutcome {
        match self.tokens.token().await {
            Ok(token) => self.fetch(order_id, token.as_deref()).await,
            Err(e) => TranscriptOutcome::Failed(format!("token lookup failed: {}", e)),
        }
    }

    /// Fetch and attach one transcript. No token means no network call.
    pub async fn fetch(&self, order_id: &str, token: Option<&str>) -> TranscriptOutcome {
        let Some(token) = token else {
            debug!(order_id = %order_id, "No auth token cached, skipping transcript fetch");
            return TranscriptOutcome::Failed("no auth token cached".to_string());
        };

        let link = match self.download(order_id, token).await {
            Ok(Some(link)) => link,
            Ok(None) => {
                debug!(order_id = %order_id, "No transcript available upstream");
                if let Err(e) = self.mark_attempted(order_id).await {
                    return TranscriptOutcome::Failed(format!("database error: {}", e));
                }
                return TranscriptOutcome::NotFound;
            }
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "Transcript fetch failed");
                return TranscriptOutcome::Failed(e);
            }
        };

        match self.attach(order_id, link).await {
            Ok(true) => {
                info!(order_id = %order_id, "Transcript attached");
                TranscriptOutcome::Attached
            }
            Ok(false) => TranscriptOutcome::NotFound,
            Err(e) => TranscriptOutcome::Failed(format!("database error: {}", e)),
        }
    }

    async fn download(&self, order_id: &str, token: &str) -> Result<Option<String>, String> {
        let response = self
            .client
            .get(self.url_for(order_id)?)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(format!("HTTP error: {}", status));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = response.bytes().await.map_err(|e| e.to_string())?;

        Ok(transcript_link(&content_type, &body))
    }

    /// Store the link on an existing transaction. False when the order is unknown.
    async fn attach(&self, order_id: &str, link: String) -> Result<bool, DbErr> {
        let Some(mut row) = Transactions::find_by_id(order_id.to_string())
            .one(&self.db)
            .await?
        else {
            return Ok(false);
        };

        let now = Utc::now();
        row.transcript_link = Some(link);
        row.last_transcript_update = Some(now);
        row.updated_at = now;

        upsert_transaction(
            &self.db,
            row,
            &[
                transactions::Column::TranscriptLink,
                transactions::Column::LastTranscriptUpdate,
            ],
        )
        .await?;

        Ok(true)
    }

    /// Record an upstream answer that carried no transcript
    async fn mark_attempted(&self, order_id: &str) -> Result<(), DbErr> {
        Transactions::update_many()
            .col_expr(
                transactions::Column::LastTranscriptUpdate,
                Expr::value(Utc::now()),
            )
            .filter(transactions::Column::OrderId.eq(order_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Transactions flagged with an image upstream that still have no transcript.
    /// Never-attempted orders come first, then the longest-waiting ones.
    pub async fn missing_transcripts(&self, limit: u64) -> Result<Vec<String>, DbErr> {
        let rows = Transactions::find()
            .filter(transactions::Column::IsImageAvailable.eq(true))
            .filter(transactions::Column::TranscriptLink.is_null())
            .filter(transactions::Column::Kind.eq("deposit"))
            .order_by_with_nulls(
                transactions::Column::LastTranscriptUpdate,
                Order::Asc,
                NullOrdering::First,
            )
            .order_by_desc(transactions::Column::UpdatedAt)
            .limit(limit)
            .all(&self.db)
            .await?;

        Ok(rows.into_iter().map(|row| row.order_id).collect())
    }
}

/// Build the transcript URL for an order. The order id becomes a single
/// percent-encoded path segment.
pub fn transcript_url(base: &str, template: &str, order_id: &str) -> Result<Url, String> {
    let mut url = Url::parse(base).map_err(|e| format!("invalid API base URL: {}", e))?;
    url.path_segments_mut()
        .map_err(|_| format!("API base URL cannot take a path: {}", base))?
        .pop_if_empty()
        .extend(
            template
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(|segment| if segment == "{orderId}" { order_id } else { segment }),
        );
    Ok(url)
}

/// Turn a transcript response into a storable link.
///
/// JSON bodies carry a URL or an inline image under `detail`; anything else
/// is treated as raw image bytes and stored as a data URL.
pub fn transcript_link(content_type: &str, body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }

    if content_type.contains("json") {
        let payload: Value = serde_json::from_slice(body).ok()?;
        let detail = payload.get("detail").unwrap_or(&payload);
        return ["url", "link", "image", "transcript"]
            .iter()
            .find_map(|key| detail.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|link| !link.is_empty())
            .map(str::to_string);
    }

    let mime = content_type.split(';').next().unwrap_or(content_type).trim();
    Some(format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(body)
    ))
}
