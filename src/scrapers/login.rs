//! Portal login form driver

use std::time::Duration;

use chromiumoxide::Page;
use tracing::{debug, info};

use crate::config::{Credentials, PortalConfig};
use crate::error::ScrapeError;
use crate::scrapers::browser::{current_url, navigate, wait_for_selector};

const USERNAME_SELECTOR: &str = "input[name='username']";
const PASSWORD_SELECTOR: &str = "input[name='password']";
const SUBMIT_SELECTORS: &[&str] = &["button[type='submit']", "form button", "input[type='submit']"];

/// Drives the login form on whichever page it is handed
pub struct LoginFlow<'a> {
    login_url: String,
    credentials: &'a Credentials,
    timeout: Duration,
}

impl<'a> LoginFlow<'a> {
    pub fn new(config: &'a PortalConfig) -> Self {
        Self {
            login_url: config.url(&config.login_path),
            credentials: &config.credentials,
            timeout: config.navigation_timeout,
        }
    }

    /// Log in and wait for the post-submit navigation. Any missing control
    /// or timeout is returned to the caller.
    pub async fn run(&self, page: &Page) -> Result<(), ScrapeError> {
        info!(username = %self.credentials.username, "Logging in to portal");
        navigate(page, &self.login_url, self.timeout).await?;

        let username = wait_for_selector(page, USERNAME_SELECTOR, self.timeout).await?;
        let password = wait_for_selector(page, PASSWORD_SELECTOR, self.timeout).await?;

        username.click().await?;
        username.type_str(&self.credentials.username).await?;
        password.click().await?;
        password.type_str(&self.credentials.password).await?;

        let mut submit = None;
        for selector in SUBMIT_SELECTORS {
            if let Ok(element) = page.find_element(*selector).await {
                submit = Some(element);
                break;
            }
        }
        let submit = submit.ok_or_else(|| ScrapeError::Selector("login submit control".to_string()))?;

        submit.click().await?;

        match tokio::time::timeout(self.timeout, page.wait_for_navigation()).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                return Err(ScrapeError::Timeout {
                    what: "post-login navigation".to_string(),
                    secs: self.timeout.as_secs(),
                });
            }
        }

        // Still on the login route means the portal rejected the credentials
        let landed = current_url(page).await.unwrap_or_default();
        if is_on_route(&landed, &self.login_url) {
            return Err(ScrapeError::Navigation(
                "still on login page after submit".to_string(),
            ));
        }

        debug!(url = %landed, "Login complete");
        Ok(())
    }
}

/// Whether `url` is on the route `target`, ignoring query, fragment and trailing slash
pub fn is_on_route(url: &str, target: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/') == target.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_matching() {
        let login = "https://portal.example.com/login";
        assert!(is_on_route("https://portal.example.com/login", login));
        assert!(is_on_route("https://portal.example.com/login/?next=/deposit", login));
        assert!(!is_on_route("https://portal.example.com/deposit/pending", login));

        let view = "https://portal.example.com/deposit/pending";
        assert!(is_on_route("https://portal.example.com/deposit/pending#top", view));
        assert!(!is_on_route("", view));
    }
}
