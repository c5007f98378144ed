//! Per-category monitor
//!
//! One `Monitor` owns one browser for one category. Start-up walks
//! Launching → Authenticating → Navigating → (Filtering) → Listening; a
//! background task then idles until the browser disconnects, the interceptor
//! dies or a stop is requested, and releases the browser before the monitor
//! reports Idle again.
//!
//! Stopping is permanent: once `stop` has been called no later `start` brings
//! a browser up, and a start that is still in progress is cancelled and torn
//! down before `stop` returns.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chromiumoxide::Page;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PortalConfig;
use crate::error::ScrapeError;
use crate::jobs::scheduler::RetryPolicy;
use crate::scrapers::browser::{
    BrowserFactory, BrowserSession, capture_session, current_url, navigate, restore_session,
    wait_for_selector,
};
use crate::scrapers::interceptor::{self, InterceptorContext};
use crate::scrapers::login::{LoginFlow, is_on_route};
use crate::scrapers::{Category, FilterStep};
use crate::services::auth_token_cache::AuthTokenCache;
use crate::services::reconciliation::ReconciliationEngine;
use crate::services::session_store::SessionStore;
use crate::services::transcript::TranscriptFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorPhase {
    Idle,
    Launching,
    Authenticating,
    Navigating,
    Filtering,
    Listening,
    Disconnected,
    Failed,
    CleaningUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    Start,
    Launched,
    Authenticated,
    ViewLoaded,
    FilterRequired,
    FilterApplied,
    ConnectionLost,
    Error,
    Stop,
    Cleanup,
    Released,
}

impl MonitorPhase {
    /// Transition table. `None` means the event is not valid in this phase.
    pub fn next(self, event: MonitorEvent) -> Option<MonitorPhase> {
        use MonitorEvent as E;
        use MonitorPhase as P;

        match (self, event) {
            (P::Idle, E::Start) => Some(P::Launching),
            (P::Launching, E::Launched) => Some(P::Authenticating),
            (P::Authenticating, E::Authenticated) => Some(P::Navigating),
            (P::Navigating, E::ViewLoaded) => Some(P::Listening),
            (P::Navigating, E::FilterRequired) => Some(P::Filtering),
            (P::Filtering, E::FilterApplied) => Some(P::Listening),
            (P::Listening, E::ConnectionLost) => Some(P::Disconnected),
            (P::Disconnected | P::Failed, E::Cleanup) => Some(P::CleaningUp),
            (P::CleaningUp, E::Released) => Some(P::Idle),
            (p, E::Error) if p.is_active() => Some(P::Failed),
            (p, E::Stop) if p.is_active() => Some(P::CleaningUp),
            _ => None,
        }
    }

    /// Phases that hold a live browser
    pub fn is_active(self) -> bool {
        matches!(
            self,
            MonitorPhase::Launching
                | MonitorPhase::Authenticating
                | MonitorPhase::Navigating
                | MonitorPhase::Filtering
                | MonitorPhase::Listening
        )
    }
}

impl std::fmt::Display for MonitorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MonitorPhase::Idle => "idle",
            MonitorPhase::Launching => "launching",
            MonitorPhase::Authenticating => "authenticating",
            MonitorPhase::Navigating => "navigating",
            MonitorPhase::Filtering => "filtering",
            MonitorPhase::Listening => "listening",
            MonitorPhase::Disconnected => "disconnected",
            MonitorPhase::Failed => "failed",
            MonitorPhase::CleaningUp => "cleaning_up",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub category: String,
    pub phase: MonitorPhase,
    pub since: DateTime<Utc>,
}

/// Components every monitor shares. Built once at start-up.
#[derive(Clone)]
pub struct MonitorDeps {
    pub portal: PortalConfig,
    pub factory: BrowserFactory,
    pub engine: ReconciliationEngine,
    pub tokens: AuthTokenCache,
    pub sessions: SessionStore,
    pub transcripts: TranscriptFetcher,
}

/// Handles owned by a running monitor. Never shared across categories.
#[derive(Default)]
struct MonitorState {
    session: Option<BrowserSession>,
    interceptor: Option<JoinHandle<()>>,
    refresh: Option<JoinHandle<()>>,
}

impl MonitorState {
    /// Abort helper tasks and close the browser. Returns once the process is gone.
    async fn release(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
        if let Some(interceptor) = self.interceptor.take() {
            interceptor.abort();
        }
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

struct MonitorInner {
    category: Category,
    deps: MonitorDeps,
    phase: RwLock<(MonitorPhase, DateTime<Utc>)>,
    /// Sticky; never reset once set
    stop: watch::Sender<bool>,
    /// Held for the whole of a start-up or a stop
    lifecycle: AsyncMutex<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    pub fn new(category: Category, deps: MonitorDeps) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(MonitorInner {
                category,
                deps,
                phase: RwLock::new((MonitorPhase::Idle, Utc::now())),
                stop,
                lifecycle: AsyncMutex::new(()),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn category(&self) -> &Category {
        &self.inner.category
    }

    pub fn phase(&self) -> MonitorPhase {
        self.inner.phase.read().0
    }

    pub fn status(&self) -> MonitorStatus {
        let (phase, since) = *self.inner.phase.read();
        MonitorStatus {
            category: self.inner.category.key.clone(),
            phase,
            since,
        }
    }

    fn advance(&self, event: MonitorEvent) -> bool {
        let mut phase = self.inner.phase.write();
        match phase.0.next(event) {
            Some(next) => {
                debug!(category = %self.inner.category.key, from = %phase.0, to = %next, "Monitor transition");
                *phase = (next, Utc::now());
                true
            }
            None => {
                warn!(
                    category = %self.inner.category.key,
                    phase = %phase.0,
                    ?event,
                    "Ignoring invalid monitor transition"
                );
                false
            }
        }
    }

    /// Bring the monitor up to Listening. On failure the browser is already
    /// released and the monitor is Idle again when this returns.
    pub async fn start(&self) -> Result<(), ScrapeError> {
        let key = &self.inner.category.key;
        let Ok(_lifecycle) = self.inner.lifecycle.try_lock() else {
            return Err(ScrapeError::AlreadyRunning(key.clone()));
        };
        if *self.inner.stop.borrow() {
            return Err(ScrapeError::Stopped(key.clone()));
        }
        if !self.advance(MonitorEvent::Start) {
            return Err(ScrapeError::AlreadyRunning(key.clone()));
        }

        let mut state = MonitorState::default();
        let mut stop = self.inner.stop.subscribe();
        let result = tokio::select! {
            result = self.bring_up(&mut state) => result,
            _ = stop_requested(&mut stop) => Err(ScrapeError::Stopped(key.clone())),
        };

        match result {
            Ok(()) => {
                self.spawn_listener(state);
                Ok(())
            }
            Err(e @ ScrapeError::Stopped(_)) => {
                info!(category = %key, "Monitor stopped during start-up");
                self.advance(MonitorEvent::Stop);
                self.tear_down(&mut state).await;
                Err(e)
            }
            Err(e) => {
                error!(category = %key, error = %e, "Monitor start-up failed");
                self.advance(MonitorEvent::Error);
                self.tear_down(&mut state).await;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, state: &mut MonitorState) -> Result<(), ScrapeError> {
        let deps = &self.inner.deps;
        let category = &self.inner.category;
        let timeout = deps.factory.navigation_timeout();
        let view_url = deps.portal.url(&category.view_path);

        info!(category = %category.key, "Launching monitor browser");
        let session = deps.factory.launch().await?;
        let page = session.page.clone();
        state.session = Some(session);

        // Attached before login so the login response reaches the token cache
        let ctx = InterceptorContext {
            category: category.clone(),
            login_endpoint: deps.portal.login_endpoint.clone(),
            engine: deps.engine.clone(),
            tokens: deps.tokens.clone(),
            transcripts: deps.transcripts.clone(),
        };
        state.interceptor = Some(interceptor::attach(&page, ctx).await?);
        self.advance(MonitorEvent::Launched);

        self.authenticate(&page, &view_url, timeout).await?;
        self.advance(MonitorEvent::Authenticated);

        if !is_on_route(&current_url(&page).await.unwrap_or_default(), &view_url) {
            navigate(&page, &view_url, timeout).await?;
        }
        // The list may still arrive through background polling, so a slow table is not fatal
        if let Err(e) = wait_for_selector(&page, &category.table_selector, timeout).await {
            warn!(category = %category.key, error = %e, "Data table did not render, continuing");
        }

        match &category.filter {
            Some(filter) => {
                self.advance(MonitorEvent::FilterRequired);
                if let Err(e) = apply_filter(&page, filter, timeout).await {
                    warn!(category = %category.key, error = %e, "Could not apply view filter");
                }
                self.advance(MonitorEvent::FilterApplied);
            }
            None => {
                self.advance(MonitorEvent::ViewLoaded);
            }
        }

        state.refresh = Some(spawn_refresh(
            page,
            category.key.clone(),
            deps.portal.refresh_interval,
        ));
        info!(category = %category.key, "Monitor listening");
        Ok(())
    }

    /// Reuse a stored session when possible, otherwise run the login form
    async fn authenticate(
        &self,
        page: &Page,
        view_url: &str,
        timeout: Duration,
    ) -> Result<(), ScrapeError> {
        let deps = &self.inner.deps;
        let category = &self.inner.category;
        let identity = &deps.portal.credentials.username;

        if let Some(snapshot) = deps.sessions.load(identity).await? {
            // Storage is origin bound, so land on the portal before restoring
            navigate(page, &deps.portal.url("/"), timeout).await?;
            match restore_session(page, &snapshot).await {
                Ok(()) => navigate(page, view_url, timeout).await?,
                Err(e) => warn!(category = %category.key, error = %e, "Session restore failed"),
            }
        }

        let url = current_url(page).await.unwrap_or_default();
        if is_on_route(&url, view_url) {
            debug!(category = %category.key, "Stored session still valid, skipping login");
            return Ok(());
        }

        LoginFlow::new(&deps.portal).run(page).await?;

        match capture_session(page).await {
            Ok(snapshot) => deps.sessions.save(identity, &snapshot).await?,
            Err(e) => warn!(category = %category.key, error = %e, "Could not capture session"),
        }
        Ok(())
    }

    fn spawn_listener(&self, mut state: MonitorState) {
        let monitor = self.clone();
        let mut stop = self.inner.stop.subscribe();

        let handle = tokio::spawn(async move {
            let key = monitor.inner.category.key.clone();

            let reason = {
                let interceptor = state.interceptor.as_mut();
                let session = state.session.as_mut();
                match (session, interceptor) {
                    (Some(session), Some(interceptor)) => {
                        tokio::select! {
                            _ = session.disconnected() => MonitorEvent::ConnectionLost,
                            _ = interceptor => MonitorEvent::ConnectionLost,
                            _ = stop_requested(&mut stop) => MonitorEvent::Stop,
                        }
                    }
                    _ => MonitorEvent::ConnectionLost,
                }
            };

            match reason {
                MonitorEvent::Stop => info!(category = %key, "Monitor stop requested"),
                _ => warn!(category = %key, "Monitor browser disconnected"),
            }

            // A finished interceptor handle must not be awaited again
            if let Some(interceptor) = &state.interceptor {
                if interceptor.is_finished() {
                    state.interceptor = None;
                }
            }

            monitor.advance(reason);
            monitor.tear_down(&mut state).await;
        });

        *self.inner.listener.lock() = Some(handle);
    }

    async fn tear_down(&self, state: &mut MonitorState) {
        if self.phase() != MonitorPhase::CleaningUp {
            self.advance(MonitorEvent::Cleanup);
        }
        state.release().await;
        self.advance(MonitorEvent::Released);
        info!(category = %self.inner.category.key, "Monitor released its browser");
    }

    /// Shut the monitor down for good and wait for its browser to be released,
    /// including one that an in-progress start has already launched
    pub async fn stop(&self) {
        self.inner.stop.send_replace(true);
        let _lifecycle = self.inner.lifecycle.lock().await;
        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                error!(category = %self.inner.category.key, error = %e, "Monitor task panicked");
            }
        }
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn spawn_refresh(page: Page, category: String, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!(category = %category, "Refreshing monitor page");
            if let Err(e) = page.reload().await {
                warn!(category = %category, error = %e, "Page refresh failed");
            }
        }
    })
}

/// Pick the filter option and submit. Each control falls back to its
/// alternate selector before giving up.
async fn apply_filter(page: &Page, filter: &FilterStep, timeout: Duration) -> Result<(), ScrapeError> {
    let selected = select_option(page, &filter.select_selector, &filter.option_value).await?
        || select_option(page, &filter.alternate_select_selector, &filter.option_value).await?;
    if !selected {
        return Err(ScrapeError::Selector(format!(
            "filter control ({} / {})",
            filter.select_selector, filter.alternate_select_selector
        )));
    }

    let submit = match wait_for_selector(page, &filter.submit_selector, timeout / 2).await {
        Ok(element) => element,
        Err(_) => wait_for_selector(page, &filter.alternate_submit_selector, timeout / 2).await?,
    };
    submit.click().await?;
    Ok(())
}

async fn select_option(page: &Page, selector: &str, value: &str) -> Result<bool, ScrapeError> {
    let script = format!(
        "(() => {{ const el = document.querySelector({}); if (!el) return false; el.value = {}; el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})()",
        serde_json::to_string(selector)?,
        serde_json::to_string(value)?
    );
    Ok(page.evaluate(script).await?.into_value()?)
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FleetReport {
    pub started: Vec<String>,
    pub already_running: Vec<String>,
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
    pub fatal: Option<String>,
}

/// Every configured monitor. Each category starts and fails on its own.
#[derive(Clone)]
pub struct MonitorFleet {
    monitors: Vec<Monitor>,
}

impl MonitorFleet {
    pub fn new(categories: &[Category], deps: MonitorDeps) -> Self {
        let monitors = categories
            .iter()
            .cloned()
            .map(|category| Monitor::new(category, deps.clone()))
            .collect();
        Self { monitors }
    }

    pub fn statuses(&self) -> Vec<MonitorStatus> {
        self.monitors.iter().map(Monitor::status).collect()
    }

    /// Start every idle monitor concurrently, retrying each on its own
    pub async fn ensure_running(&self, retry: RetryPolicy) -> FleetReport {
        let mut report = FleetReport::default();
        let mut pending = Vec::new();

        for monitor in &self.monitors {
            if monitor.phase() == MonitorPhase::Idle {
                pending.push(monitor.clone());
            } else {
                report.already_running.push(monitor.category().key.clone());
            }
        }

        let results = join_all(pending.iter().map(|monitor| async move {
            let what = format!("monitor {}", monitor.category().key);
            let result = retry.run(&what, |_| monitor.start()).await;
            (monitor.category().key.clone(), result)
        }))
        .await;

        for (key, result) in results {
            match result {
                Ok(()) => report.started.push(key),
                Err(ScrapeError::AlreadyRunning(_)) => report.already_running.push(key),
                Err(ScrapeError::Stopped(_)) => report.stopped.push(key),
                Err(e) => {
                    if e.is_fatal() && report.fatal.is_none() {
                        report.fatal = Some(e.to_string());
                    }
                    report.failed.push(key);
                }
            }
        }

        report
    }

    /// Stop every monitor, giving up on stragglers after `timeout`
    pub async fn shutdown(&self, timeout: Duration) {
        let stops = join_all(self.monitors.iter().map(Monitor::stop));
        if tokio::time::timeout(timeout, stops).await.is_err() {
            warn!("Timed out waiting for monitors to release their browsers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MonitorEvent as E;
    use MonitorPhase as P;

    fn walk(start: MonitorPhase, events: &[MonitorEvent]) -> Option<MonitorPhase> {
        events.iter().try_fold(start, |phase, event| phase.next(*event))
    }

    #[test]
    fn test_happy_path_without_filter() {
        let phase = walk(
            P::Idle,
            &[E::Start, E::Launched, E::Authenticated, E::ViewLoaded],
        );
        assert_eq!(phase, Some(P::Listening));
    }

    #[test]
    fn test_filtering_step() {
        let phase = walk(
            P::Idle,
            &[
                E::Start,
                E::Launched,
                E::Authenticated,
                E::FilterRequired,
                E::FilterApplied,
            ],
        );
        assert_eq!(phase, Some(P::Listening));
    }

    #[test]
    fn test_disconnect_cycles_back_to_idle() {
        let phase = walk(P::Listening, &[E::ConnectionLost, E::Cleanup, E::Released]);
        assert_eq!(phase, Some(P::Idle));
    }

    #[test]
    fn test_failure_in_any_active_phase_cleans_up() {
        for phase in [P::Launching, P::Authenticating, P::Navigating, P::Filtering, P::Listening] {
            assert_eq!(walk(phase, &[E::Error, E::Cleanup, E::Released]), Some(P::Idle));
            assert_eq!(walk(phase, &[E::Stop, E::Released]), Some(P::Idle));
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(P::Idle.next(E::Launched), None);
        assert_eq!(P::Listening.next(E::Start), None);
        assert_eq!(P::Idle.next(E::Stop), None);
        assert_eq!(P::CleaningUp.next(E::Start), None);
        // Idle can only be reached by releasing the browser
        assert_eq!(P::Disconnected.next(E::Released), None);
    }
}
