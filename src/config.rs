//! Process configuration loaded from the environment (`.env` via dotenvy)

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::scrapers::Category;

const ENV_DATABASE_URL: &str = "DATABASE_URL";
const ENV_PORTAL_BASE_URL: &str = "PORTAL_BASE_URL";
const ENV_PORTAL_API_BASE_URL: &str = "PORTAL_API_BASE_URL";
const ENV_PORTAL_USERNAME: &str = "PORTAL_USERNAME";
const ENV_PORTAL_PASSWORD: &str = "PORTAL_PASSWORD";
const ENV_TOKEN_STALE_AFTER: &str = "TOKEN_STALE_AFTER_SECS";
const ENV_TOKEN_MAX_AGE: &str = "TOKEN_MAX_AGE_SECS";
const ENV_SESSION_TTL: &str = "SESSION_TTL_SECS";
const ENV_SCRAPE_INTERVAL: &str = "SCRAPE_INTERVAL_SECS";
const ENV_PENDING_CHECK_INTERVAL: &str = "PENDING_CHECK_INTERVAL_SECS";
const ENV_SESSION_CLEANUP_INTERVAL: &str = "SESSION_CLEANUP_INTERVAL_SECS";
const ENV_BACKFILL_INTERVAL: &str = "TRANSCRIPT_BACKFILL_INTERVAL_SECS";
const ENV_PENDING_OVERDUE: &str = "PENDING_OVERDUE_SECS";
const ENV_RETRY_MAX: &str = "RETRY_MAX";
const ENV_RETRY_DELAY_MS: &str = "RETRY_DELAY_MS";
const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";
const ENV_BROWSER_HEADLESS: &str = "BROWSER_HEADLESS";
const ENV_NAVIGATION_TIMEOUT: &str = "NAVIGATION_TIMEOUT_SECS";
const ENV_MONITOR_REFRESH: &str = "MONITOR_REFRESH_SECS";
const ENV_MONITOR_CATEGORIES: &str = "MONITOR_CATEGORIES";
const ENV_STATUS_BIND_ADDR: &str = "STATUS_BIND_ADDR";

/// 5h40m; the portal token lives for six hours
const DEFAULT_TOKEN_STALE_AFTER_SECS: u64 = 20_400;
const DEFAULT_TOKEN_MAX_AGE_SECS: u64 = 86_400;
const DEFAULT_SESSION_TTL_SECS: u64 = 86_400;
const DEFAULT_SCRAPE_INTERVAL_SECS: u64 = 30;
const DEFAULT_PENDING_CHECK_INTERVAL_SECS: u64 = 60;
const DEFAULT_SESSION_CLEANUP_INTERVAL_SECS: u64 = 3_600;
const DEFAULT_BACKFILL_INTERVAL_SECS: u64 = 900;
const DEFAULT_PENDING_OVERDUE_SECS: u64 = 900;
const DEFAULT_RETRY_MAX: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;
const DEFAULT_NAVIGATION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MONITOR_REFRESH_SECS: u64 = 60;
const DEFAULT_STATUS_BIND_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("unknown monitor category: {0}")]
    UnknownCategory(String),
}

/// Credentials used by the login flow
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Everything the browser side needs to reach the portal
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub api_base_url: String,
    pub credentials: Credentials,
    pub login_path: String,
    pub login_endpoint: String,
    pub transcript_path: String,
    pub chrome_executable: Option<String>,
    pub headless: bool,
    pub navigation_timeout: Duration,
    pub refresh_interval: Duration,
}

impl PortalConfig {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub scrape_interval: Duration,
    pub pending_check_interval: Duration,
    pub session_cleanup_interval: Duration,
    pub backfill_interval: Duration,
    pub pending_overdue: Duration,
    pub retry_max: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub portal: PortalConfig,
    pub schedule: ScheduleConfig,
    pub token_stale_after: Duration,
    pub token_max_age: Duration,
    pub session_ttl: Duration,
    pub categories: Vec<Category>,
    pub status_bind_addr: SocketAddr,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any key lookup so tests don't touch the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let secs = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            parse_or(&lookup, name, default).map(Duration::from_secs)
        };

        let base_url = required(ENV_PORTAL_BASE_URL)?
            .trim_end_matches('/')
            .to_string();
        let api_base_url = lookup(ENV_PORTAL_API_BASE_URL)
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| base_url.clone());

        let headless = match lookup(ENV_BROWSER_HEADLESS) {
            None => true,
            Some(v) => match v.to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: ENV_BROWSER_HEADLESS,
                        value: v,
                    });
                }
            },
        };

        let categories = match lookup(ENV_MONITOR_CATEGORIES) {
            Some(list) if !list.trim().is_empty() => list
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(|key| {
                    Category::by_key(key).ok_or_else(|| ConfigError::UnknownCategory(key.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => Category::all(),
        };

        let status_bind_addr = lookup(ENV_STATUS_BIND_ADDR)
            .unwrap_or_else(|| DEFAULT_STATUS_BIND_ADDR.to_string());
        let status_bind_addr = status_bind_addr
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::Invalid {
                name: ENV_STATUS_BIND_ADDR,
                value: status_bind_addr.clone(),
            })?;

        Ok(Self {
            database_url: required(ENV_DATABASE_URL)?,
            portal: PortalConfig {
                base_url,
                api_base_url,
                credentials: Credentials {
                    username: required(ENV_PORTAL_USERNAME)?,
                    password: required(ENV_PORTAL_PASSWORD)?,
                },
                login_path: "/login".to_string(),
                login_endpoint: "/api/auth/login".to_string(),
                transcript_path: "/api/transactions/{orderId}/transcript".to_string(),
                chrome_executable: lookup(ENV_CHROME_EXECUTABLE).filter(|v| !v.trim().is_empty()),
                headless,
                navigation_timeout: secs(ENV_NAVIGATION_TIMEOUT, DEFAULT_NAVIGATION_TIMEOUT_SECS)?,
                refresh_interval: secs(ENV_MONITOR_REFRESH, DEFAULT_MONITOR_REFRESH_SECS)?,
            },
            schedule: ScheduleConfig {
                scrape_interval: secs(ENV_SCRAPE_INTERVAL, DEFAULT_SCRAPE_INTERVAL_SECS)?,
                pending_check_interval: secs(
                    ENV_PENDING_CHECK_INTERVAL,
                    DEFAULT_PENDING_CHECK_INTERVAL_SECS,
                )?,
                session_cleanup_interval: secs(
                    ENV_SESSION_CLEANUP_INTERVAL,
                    DEFAULT_SESSION_CLEANUP_INTERVAL_SECS,
                )?,
                backfill_interval: secs(ENV_BACKFILL_INTERVAL, DEFAULT_BACKFILL_INTERVAL_SECS)?,
                pending_overdue: secs(ENV_PENDING_OVERDUE, DEFAULT_PENDING_OVERDUE_SECS)?,
                retry_max: parse_or(&lookup, ENV_RETRY_MAX, DEFAULT_RETRY_MAX)?,
                retry_delay: Duration::from_millis(parse_or(
                    &lookup,
                    ENV_RETRY_DELAY_MS,
                    DEFAULT_RETRY_DELAY_MS,
                )?),
            },
            token_stale_after: secs(ENV_TOKEN_STALE_AFTER, DEFAULT_TOKEN_STALE_AFTER_SECS)?,
            token_max_age: secs(ENV_TOKEN_MAX_AGE, DEFAULT_TOKEN_MAX_AGE_SECS)?,
            session_ttl: secs(ENV_SESSION_TTL, DEFAULT_SESSION_TTL_SECS)?,
            categories,
            status_bind_addr,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}
