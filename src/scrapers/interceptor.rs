//! Response interceptor
//!
//! Watches a page's network traffic. Login responses refresh the auth token
//! cache, the category's list response feeds reconciliation, and everything
//! else is ignored. Body handling runs on spawned tasks so the page's event
//! loop never waits on the database.

use std::collections::HashMap;

use base64::Engine;
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventResponseReceived, GetResponseBodyParams,
    RequestId,
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ScrapeError;
use crate::scrapers::Category;
use crate::scrapers::parser::{extract_login_token, extract_records};
use crate::services::auth_token_cache::AuthTokenCache;
use crate::services::reconciliation::{BatchReport, ReconciliationEngine};
use crate::services::transcript::{TranscriptFetcher, TranscriptOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Login,
    TransactionList,
    Other,
}

/// Classify a response URL by its path. Query strings are ignored.
pub fn classify(url: &str, login_endpoint: &str, category: &Category) -> ResponseKind {
    let path = url.split(['?', '#']).next().unwrap_or(url).trim_end_matches('/');

    if path.ends_with(login_endpoint.trim_end_matches('/')) {
        ResponseKind::Login
    } else if path.ends_with(category.list_endpoint.trim_end_matches('/')) {
        ResponseKind::TransactionList
    } else {
        ResponseKind::Other
    }
}

/// Everything the interceptor hands captured bodies to
#[derive(Clone)]
pub struct InterceptorContext {
    pub category: Category,
    pub login_endpoint: String,
    pub engine: ReconciliationEngine,
    pub tokens: AuthTokenCache,
    pub transcripts: TranscriptFetcher,
}

impl InterceptorContext {
    /// Offer the token from a login response to the cache
    pub async fn handle_login_body(&self, body: &str) -> Result<bool, ScrapeError> {
        let payload: Value = serde_json::from_str(body)?;
        let Some(token) = extract_login_token(&payload) else {
            warn!(category = %self.category.key, "Login response carried no token");
            return Ok(false);
        };
        Ok(self.tokens.offer(&token).await?)
    }

    /// Reconcile a list response and kick off transcript fetches it made due
    pub async fn handle_list_body(&self, body: &str) -> Result<BatchReport, ScrapeError> {
        let payload: Value = serde_json::from_str(body)?;
        let Some(records) = extract_records(payload) else {
            warn!(category = %self.category.key, "Unrecognised list payload shape, ignoring");
            return Ok(BatchReport::default());
        };

        let report = self.engine.reconcile_batch(&records, &self.category).await;

        for order_id in report.transcripts_due.iter().cloned() {
            let transcripts = self.transcripts.clone();
            tokio::spawn(async move {
                match transcripts.fetch_with_cached_token(&order_id).await {
                    TranscriptOutcome::Attached => {}
                    TranscriptOutcome::NotFound => {
                        debug!(order_id = %order_id, "Transcript not available yet")
                    }
                    TranscriptOutcome::Failed(reason) => {
                        warn!(order_id = %order_id, reason = %reason, "Transcript fetch failed")
                    }
                }
            });
        }

        Ok(report)
    }

    async fn dispatch(&self, kind: ResponseKind, body: String) {
        let result = match kind {
            ResponseKind::Login => self.handle_login_body(&body).await.map(|refreshed| {
                if refreshed {
                    info!(category = %self.category.key, "Captured fresh auth token");
                }
            }),
            ResponseKind::TransactionList => self.handle_list_body(&body).await.map(|_| ()),
            ResponseKind::Other => Ok(()),
        };

        if let Err(e) = result {
            warn!(category = %self.category.key, error = %e, "Failed to process intercepted response");
        }
    }
}

/// Subscribe to the page's network events. The returned task ends when the
/// page's event streams close, which happens when the page or browser goes away.
pub async fn attach(page: &Page, ctx: InterceptorContext) -> Result<JoinHandle<()>, ScrapeError> {
    let mut responses = page.event_listener::<EventResponseReceived>().await?;
    let mut finished = page.event_listener::<EventLoadingFinished>().await?;
    let mut failed = page.event_listener::<EventLoadingFailed>().await?;
    let page = page.clone();

    let handle = tokio::spawn(async move {
        // Bodies are only readable once loading has finished
        let mut awaiting: HashMap<RequestId, ResponseKind> = HashMap::new();

        loop {
            tokio::select! {
                event = responses.next() => {
                    let Some(event) = event else { break };
                    let kind = classify(&event.response.url, &ctx.login_endpoint, &ctx.category);
                    if kind != ResponseKind::Other {
                        debug!(category = %ctx.category.key, url = %event.response.url, ?kind, "Intercepted response");
                        awaiting.insert(event.request_id.clone(), kind);
                    }
                }
                event = finished.next() => {
                    let Some(event) = event else { break };
                    let Some(kind) = awaiting.remove(&event.request_id) else { continue };
                    match read_body(&page, event.request_id.clone()).await {
                        Ok(body) => {
                            let ctx = ctx.clone();
                            tokio::spawn(async move { ctx.dispatch(kind, body).await });
                        }
                        Err(e) => warn!(category = %ctx.category.key, error = %e, "Could not read response body"),
                    }
                }
                event = failed.next() => {
                    let Some(event) = event else { break };
                    awaiting.remove(&event.request_id);
                }
            }
        }

        debug!(category = %ctx.category.key, "Response interceptor detached");
    });

    Ok(handle)
}

async fn read_body(page: &Page, request_id: RequestId) -> Result<String, ScrapeError> {
    let response = page.execute(GetResponseBodyParams::new(request_id)).await?;
    let body = &response.result;
    if body.base64_encoded {
        let bytes = base64::engine::general_purpose::STANDARD.decode(&body.body)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        Ok(body.body.clone())
    }
}
