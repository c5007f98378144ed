//! Browser session factory
//!
//! The only place that knows how to launch and tear down a headless Chromium
//! instance. Every session gets its own browser process so monitors never share
//! one.

use std::time::{Duration, Instant};

use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, EnableParams};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PortalConfig;
use crate::error::ScrapeError;
use crate::services::session_store::{SessionSnapshot, StoredCookie};

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const VIEWPORT_WIDTH: u32 = 1920;
const VIEWPORT_HEIGHT: u32 = 1080;
const SELECTOR_POLL: Duration = Duration::from_millis(250);

const HARDENING_ARGS: &[&str] = &[
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-blink-features=AutomationControlled",
    "--mute-audio",
];

/// An exclusively owned browser + page pair
pub struct BrowserSession {
    pub browser: Browser,
    pub page: Page,
    /// Finishes when the CDP connection drops
    handler_task: JoinHandle<()>,
}

impl BrowserSession {
    /// Resolve when the browser connection closes
    pub async fn disconnected(&mut self) {
        if !self.handler_task.is_finished() {
            let _ = (&mut self.handler_task).await;
        }
    }

    /// Close page then browser and wait for the process to exit
    pub async fn close(mut self) {
        if let Err(e) = self.page.close().await {
            debug!("Page close failed (already gone?): {}", e);
        }
        if let Err(e) = self.browser.close().await {
            debug!("Browser close failed (already gone?): {}", e);
        }
        if let Err(e) = self.browser.wait().await {
            warn!("Waiting for browser exit failed: {}", e);
        }
        self.handler_task.abort();
    }
}

#[derive(Clone)]
pub struct BrowserFactory {
    chrome_executable: Option<String>,
    headless: bool,
    navigation_timeout: Duration,
}

impl BrowserFactory {
    pub fn new(config: &PortalConfig) -> Self {
        Self {
            chrome_executable: config.chrome_executable.clone(),
            headless: config.headless,
            navigation_timeout: config.navigation_timeout,
        }
    }

    pub fn navigation_timeout(&self) -> Duration {
        self.navigation_timeout
    }

    fn browser_config(&self) -> Result<BrowserConfig, ScrapeError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(VIEWPORT_WIDTH, VIEWPORT_HEIGHT)
            .request_timeout(self.navigation_timeout)
            .args(HARDENING_ARGS.iter().copied());

        if !self.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.chrome_executable {
            builder = builder.chrome_executable(path);
        }

        // build() fails when no Chrome/Chromium binary can be located
        builder.build().map_err(ScrapeError::BrowserConfig)
    }

    /// Check up front that a browser can be configured at all
    pub fn verify(&self) -> Result<(), ScrapeError> {
        self.browser_config().map(|_| ())
    }

    pub async fn launch(&self) -> Result<BrowserSession, ScrapeError> {
        let config = self.browser_config()?;
        // build() already located the binary, so a failure here is transient
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScrapeError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler event error: {}", e);
                }
            }
            debug!("Browser handler stream ended");
        });

        let page = match self.open_page(&browser).await {
            Ok(page) => page,
            Err(e) => {
                let mut browser = browser;
                let _ = browser.close().await;
                let _ = browser.wait().await;
                handler_task.abort();
                return Err(e);
            }
        };

        info!("Launched headless browser session");
        Ok(BrowserSession {
            browser,
            page,
            handler_task,
        })
    }

    async fn open_page(&self, browser: &Browser) -> Result<Page, ScrapeError> {
        let page = browser.new_page("about:blank").await?;
        page.execute(SetUserAgentOverrideParams::new(USER_AGENT.to_string()))
            .await?;
        page.execute(EnableParams::default()).await?;
        Ok(page)
    }
}

/// Poll for a selector until it shows up or the timeout passes
pub async fn wait_for_selector(
    page: &Page,
    selector: &str,
    timeout: Duration,
) -> Result<chromiumoxide::Element, ScrapeError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(element) = page.find_element(selector).await {
            return Ok(element);
        }
        if Instant::now() >= deadline {
            return Err(ScrapeError::Timeout {
                what: format!("selector `{}`", selector),
                secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(SELECTOR_POLL).await;
    }
}

/// Navigate and bound the wait for the load to finish
pub async fn navigate(page: &Page, url: &str, timeout: Duration) -> Result<(), ScrapeError> {
    match tokio::time::timeout(timeout, page.goto(url)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(ScrapeError::Navigation(format!("{}: {}", url, e))),
        Err(_) => Err(ScrapeError::Timeout {
            what: format!("navigation to {}", url),
            secs: timeout.as_secs(),
        }),
    }
}

pub async fn current_url(page: &Page) -> Option<String> {
    page.url().await.ok().flatten()
}

/// Snapshot cookies and web storage so the next launch can skip the login form
pub async fn capture_session(page: &Page) -> Result<SessionSnapshot, ScrapeError> {
    let cookies = page
        .get_cookies()
        .await?
        .into_iter()
        .map(|c| StoredCookie {
            name: c.name,
            value: c.value,
            domain: c.domain,
            path: c.path,
            secure: c.secure,
            http_only: c.http_only,
        })
        .collect();

    let local_storage = read_storage(page, "localStorage").await?;
    let session_storage = read_storage(page, "sessionStorage").await?;

    Ok(SessionSnapshot {
        cookies,
        local_storage,
        session_storage,
    })
}

async fn read_storage(
    page: &Page,
    storage: &str,
) -> Result<std::collections::BTreeMap<String, String>, ScrapeError> {
    let script = format!("JSON.stringify(Object.assign({{}}, window.{}))", storage);
    let raw: String = page.evaluate(script).await?.into_value()?;
    Ok(serde_json::from_str(&raw)?)
}

/// Restore a snapshot. Storage is origin-bound, so the page must already be on
/// the portal origin when this runs.
pub async fn restore_session(page: &Page, snapshot: &SessionSnapshot) -> Result<(), ScrapeError> {
    let cookies = snapshot
        .cookies
        .iter()
        .filter_map(|c| {
            CookieParam::builder()
                .name(c.name.clone())
                .value(c.value.clone())
                .domain(c.domain.clone())
                .path(c.path.clone())
                .secure(c.secure)
                .http_only(c.http_only)
                .build()
                .map_err(|e| warn!(cookie = %c.name, "Skipping unrestorable cookie: {}", e))
                .ok()
        })
        .collect::<Vec<_>>();

    if !cookies.is_empty() {
        page.set_cookies(cookies).await?;
    }

    for (storage, entries) in [
        ("localStorage", &snapshot.local_storage),
        ("sessionStorage", &snapshot.session_storage),
    ] {
        if entries.is_empty() {
            continue;
        }
        let script = format!(
            "(() => {{ const entries = {}; for (const [k, v] of Object.entries(entries)) {{ window.{}.setItem(k, v); }} return true; }})()",
            serde_json::to_string(entries)?,
            storage
        );
        page.evaluate(script).await?;
    }

    Ok(())
}
