//! Job scheduling primitives: single-flight guard, retry policy and the
//! interval loop every periodic job runs on.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};

use crate::error::ScrapeError;

pub type JobResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Prevents overlapping runs of the same job. A trigger that finds the job
/// running is dropped, never queued.
#[derive(Clone, Default)]
pub struct SingleFlight {
    running: Arc<AtomicBool>,
}

pub struct FlightGuard {
    running: Arc<AtomicBool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<FlightGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                running: self.running.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RunOutcome {
    Completed,
    Failed(String),
}

/// Bounded retries with exponential backoff from a base delay
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retrying after the given (zero based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error or runs
    /// out of attempts.
    /// Each attempt is a fresh call so callers rebuild their session inside it.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ScrapeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ScrapeError>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt + 1 >= self.max_attempts {
                        tracing::error!(
                            "{} failed after {} attempts: {}",
                            what,
                            self.max_attempts,
                            e
                        );
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}",
                        what,
                        attempt + 1,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Owns the shutdown signal shared by every periodic job
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Spawn a job on a fixed cadence. Ticks that land while the previous run
    /// is still going are skipped.
    pub fn spawn_job<F, Fut>(&mut self, name: &'static str, every: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let flight = SingleFlight::new();
        let job = Arc::new(job);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!("Scheduled job '{}' every {:?}", name, every);

            // At most one run exists at a time, guarded by `flight`
            let mut in_flight: Option<JoinHandle<()>> = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let Some(guard) = flight.try_acquire() else {
                    tracing::debug!("Job '{}' still running, skipping tick", name);
                    continue;
                };

                // Run detached so a slow run never delays the shutdown check
                let job = job.clone();
                in_flight = Some(tokio::spawn(async move {
                    let _guard = guard;
                    match run_once(name, job.as_ref()).await {
                        RunOutcome::Failed(e) => tracing::error!("Job '{}' failed: {}", name, e),
                        RunOutcome::Completed => tracing::debug!("Job '{}' finished", name),
                    }
                }));
            }

            if let Some(run) = in_flight.filter(|run| !run.is_finished()) {
                tracing::info!("Waiting for in-flight run of '{}'", name);
                if let Err(e) = run.await {
                    tracing::error!("Job '{}' run panicked: {}", name, e);
                }
            }

            tracing::info!("Job '{}' stopped", name);
        });

        self.handles.push(handle);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop ticking and wait for runs already in flight to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_once<F, Fut>(name: &str, job: &F) -> RunOutcome
where
    F: Fn() -> Fut,
    Fut: Future<Output = JobResult>,
{
    tracing::debug!("Running job '{}'", name);
    match job().await {
        Ok(()) => RunOutcome::Completed,
        Err(e) => RunOutcome::Failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_single_flight_guard_releases_on_drop() {
        let flight = SingleFlight::new();
        let guard = flight.try_acquire();
        assert!(guard.is_some());
        assert!(flight.try_acquire().is_none());
        drop(guard);
        assert!(!flight.is_running());
        assert!(flight.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_overlapping_ticks_are_skipped() {
        let runs = Arc::new(AtomicU32::new(0));
        let active = Arc::new(AtomicU32::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let mut scheduler = Scheduler::new();
        {
            let runs = runs.clone();
            let active = active.clone();
            let overlapped = overlapped.clone();
            scheduler.spawn_job("scrape", Duration::from_millis(10), move || {
                let runs = runs.clone();
                let active = active.clone();
                let overlapped = overlapped.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        // Roughly 25 ticks land while each run takes ten of them
        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop().await;

        let runs = runs.load(Ordering::SeqCst);
        assert!((2..=4).contains(&runs), "expected 2-4 runs, got {}", runs);
        assert!(!overlapped.load(Ordering::SeqCst));
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_run() {
        let finished = Arc::new(AtomicBool::new(false));

        let mut scheduler = Scheduler::new();
        {
            let finished = finished.clone();
            scheduler.spawn_job("cleanup", Duration::from_secs(3600), move || {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        // The first tick fires immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let result = policy
            .run("login", |_| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ScrapeError::Selector("#username".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_and_skips_fatal() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let result: Result<(), _> = policy
            .run("navigate", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ScrapeError::Navigation("reset".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("launch", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ScrapeError::BrowserConfig("no chrome".into())) }
            })
            .await;
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_launch_failures_are_retried() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let result = policy
            .run("launch", |_| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ScrapeError::Launch("chrome exited before connecting".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stopped_monitor_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let result: Result<(), _> = policy
            .run("monitor deposit_pending", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ScrapeError::Stopped("deposit_pending".into())) }
            })
            .await;

        assert!(matches!(result, Err(ScrapeError::Stopped(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
