use crate::jobs::scheduler::JobResult;
use crate::services::session_store::SessionStore;

pub async fn run_session_cleanup(sessions: &SessionStore) -> JobResult {
    let purged = sessions.purge_expired().await?;
    tracing::debug!("Session cleanup removed {} snapshots", purged);
    Ok(())
}
