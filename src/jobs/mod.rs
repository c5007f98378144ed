pub mod scheduler;
pub mod scrape_cycle;
pub mod session_cleanup;
pub mod pending_followup;
pub mod transcript_backfill;
