use std::time::Duration;

use rand::Rng;

use crate::jobs::scheduler::JobResult;
use crate::services::transcript::{TranscriptFetcher, TranscriptOutcome};

/// Upper bound on orders handled per backfill run
pub const BACKFILL_BATCH: u64 = 50;

const JITTER_MIN_MS: u64 = 500;
const JITTER_MAX_MS: u64 = 2_500;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BackfillReport {
    pub attached: usize,
    pub not_found: usize,
    pub failed: usize,
}

/// Fetch transcripts for deposits flagged with an image but still missing one.
/// Calls are spaced by a random delay so the portal never sees a burst.
pub async fn run_transcript_backfill(
    fetcher: &TranscriptFetcher,
    limit: u64,
) -> Result<BackfillReport, Box<dyn std::error::Error + Send + Sync>> {
    let mut report = BackfillReport::default();

    // Nothing can succeed without a token; skip the scan entirely
    let Some(token) = fetcher.tokens().token().await? else {
        tracing::debug!("No auth token cached yet, skipping transcript backfill");
        return Ok(report);
    };

    let order_ids = fetcher.missing_transcripts(limit).await?;
    if order_ids.is_empty() {
        return Ok(report);
    }

    tracing::info!("Backfilling transcripts for {} transactions", order_ids.len());

    for (i, order_id) in order_ids.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(jitter()).await;
        }

        match fetcher.fetch(order_id, Some(&token)).await {
            TranscriptOutcome::Attached => report.attached += 1,
            TranscriptOutcome::NotFound => report.not_found += 1,
            TranscriptOutcome::Failed(reason) => {
                tracing::warn!(order_id = %order_id, "Backfill fetch failed: {}", reason);
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        "Transcript backfill done: {} attached, {} not found, {} failed",
        report.attached,
        report.not_found,
        report.failed
    );

    Ok(report)
}

pub async fn run_backfill_job(fetcher: &TranscriptFetcher) -> JobResult {
    run_transcript_backfill(fetcher, BACKFILL_BATCH).await.map(|_| ())
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(JITTER_MIN_MS..=JITTER_MAX_MS))
}
