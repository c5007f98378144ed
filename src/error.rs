//! Error types for the ingestion pipeline

use chromiumoxide::error::CdpError;
use sea_orm::DbErr;

/// Errors raised while driving a browser session or a scheduled cycle.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// No runnable browser binary or an unusable launch configuration
    #[error("Browser configuration error: {0}")]
    BrowserConfig(String),

    /// The binary exists but the process did not come up or connect
    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Browser protocol error: {0}")]
    Cdp(#[from] CdpError),

    #[error("Timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("Selector not found: {0}")]
    Selector(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Monitor '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Monitor '{0}' has been shut down")]
    Stopped(String),

    #[error("Database error: {0}")]
    Db(#[from] DbErr),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Undecodable response body: {0}")]
    Decode(#[from] base64::DecodeError),
}

impl ScrapeError {
    /// Fatal errors abort start-up and are never retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScrapeError::BrowserConfig(_))
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal() && !matches!(self, ScrapeError::AlreadyRunning(_) | ScrapeError::Stopped(_))
    }
}

/// Problems with one scraped element. The rest of the batch still runs.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no orderID")]
    MissingOrderId,

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("Database error: {0}")]
    Db(#[from] DbErr),

    #[error("Transaction {0} kept changing under concurrent writers")]
    Contended(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_errors_are_fatal() {
        assert!(ScrapeError::BrowserConfig("no chrome".into()).is_fatal());
        assert!(!ScrapeError::Selector("#login".into()).is_fatal());
        assert!(
            !ScrapeError::Timeout {
                what: "navigation".into(),
                secs: 30
            }
            .is_fatal()
        );
        assert!(!ScrapeError::Launch("websocket closed".into()).is_fatal());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ScrapeError::Launch("chrome exited early".into()).is_retryable());
        assert!(ScrapeError::Navigation("reset".into()).is_retryable());
        assert!(!ScrapeError::BrowserConfig("no chrome".into()).is_retryable());
        assert!(!ScrapeError::Stopped("deposit_pending".into()).is_retryable());
        assert!(!ScrapeError::AlreadyRunning("deposit_pending".into()).is_retryable());
    }
}
