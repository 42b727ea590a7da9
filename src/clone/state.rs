use log::{info, warn};

use crate::error::EngineResult;
use crate::events::{CloneProgress, EngineEvent};
use crate::model::CloneJobStatus;

use super::engine::CloneInner;

/// Compare-and-set the job status; publishes the change when it happened.
pub(super) async fn transition(
    inner: &CloneInner,
    job_id: &str,
    from: &[CloneJobStatus],
    to: CloneJobStatus,
    error: Option<String>,
) -> EngineResult<bool> {
    let moved = inner
        .store
        .transition_clone_job(job_id, from, to, error.as_deref())
        .await?;
    if moved {
        match error.as_ref() {
            Some(err) => warn!("clone_status: {} -> {} error={}", job_id, to, err),
            None => info!("clone_status: {} -> {}", job_id, to),
        }
        inner.events.clone_status(job_id, to, error);
    }
    Ok(moved)
}

/// Publish a counter snapshot, throttled per job unless `force` is set.
pub(super) async fn publish_progress(
    inner: &CloneInner,
    job_id: &str,
    current_key: Option<String>,
    force: bool,
) {
    let job = match inner.store.get_clone_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(e) => {
            warn!("clone_progress_lookup_failed: {} error={}", job_id, e);
            return;
        }
    };
    let interval = inner.config.progress_interval();
    if let Some(sample) = inner.tracker.sample_if_due(
        job_id,
        job.transferred_bytes,
        Some(job.total_bytes),
        interval,
        force,
    ) {
        inner
            .events
            .publish(EngineEvent::CloneProgress(CloneProgress::from_job(
                &job,
                current_key,
                sample,
            )));
    }
}
