use crate::jobs::scheduler::{JobResult, RetryPolicy};
use crate::scrapers::monitor::MonitorFleet;

/// Bring every idle monitor back up. Monitors already listening are left alone.
pub async fn run_scrape_cycle(fleet: &MonitorFleet, retry: RetryPolicy) -> JobResult {
    let report = fleet.ensure_running(retry).await;

    if !report.started.is_empty() || !report.failed.is_empty() {
        tracing::info!(
            "Scrape cycle: {} started, {} already running, {} failed",
            report.started.len(),
            report.already_running.len(),
            report.failed.len()
        );
    }
    if !report.failed.is_empty() {
        tracing::warn!("Monitors deferred to next tick: {}", report.failed.join(", "));
    }
    if !report.stopped.is_empty() {
        tracing::debug!("Monitors shut down, not restarting: {}", report.stopped.join(", "));
    }

    match report.fatal {
        Some(reason) => Err(reason.into()),
        None => Ok(()),
    }
}
