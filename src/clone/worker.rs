use futures_util::FutureExt;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;

use crate::error::{EngineError, EngineResult};
use crate::model::{CloneJob, CloneJobItem, CloneJobStatus, ConflictPolicy, ItemOutcome};
use crate::multipart::{discard_session, is_plain_md5, NoProgress, ObjectRef, PartSource, Transfer};
use crate::storage::ObjectEntry;

use super::engine::{CloneInner, JobControl};
use super::enumerate::{enumerate, EnumerationEnd};
use super::state;

pub(super) enum JobEnd {
    Completed,
    /// Pause requested and every in-flight item drained.
    Paused,
    /// Cancelled, or moved to another state by someone else.
    Stopped,
}

/// Whether the conflict policy lets the item overwrite `existing`.
/// Unknown timestamps never block a transfer.
pub(super) fn should_transfer(
    policy: ConflictPolicy,
    source_last_modified: Option<i64>,
    existing: Option<&ObjectEntry>,
) -> bool {
    let Some(existing) = existing else {
        return true;
    };
    match policy {
        ConflictPolicy::Skip => false,
        ConflictPolicy::Overwrite => true,
        ConflictPolicy::OverwriteIfNewer => match (source_last_modified, existing.last_modified) {
            (Some(source), Some(dest)) => source > dest,
            _ => true,
        },
    }
}

async fn copy_item(
    inner: &CloneInner,
    job: &CloneJob,
    item: &CloneJobItem,
    control: &JobControl,
) -> EngineResult<ItemOutcome> {
    if control.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    if item.dest_key.is_empty() {
        debug!("clone_item_skip_empty_key: {} key={}", item.id, item.source_key);
        return Ok(ItemOutcome::Skipped);
    }

    if job.conflict_policy != ConflictPolicy::Overwrite {
        let existing = inner
            .storage
            .head_object(&job.dest_target_id, &job.dest_bucket, &item.dest_key)
            .await?;
        if !should_transfer(
            job.conflict_policy,
            item.source_last_modified,
            existing.as_ref(),
        ) {
            debug!(
                "clone_item_skip_existing: {} key={} policy={}",
                item.id, item.dest_key, job.conflict_policy
            );
            return Ok(ItemOutcome::Skipped);
        }
    }

    if job.is_same_target {
        inner
            .storage
            .copy_object(
                &job.source_target_id,
                &job.source_bucket,
                &item.source_key,
                &job.dest_bucket,
                &item.dest_key,
            )
            .await?;
        if inner.config.verify_checksum {
            verify_copy(inner, job, item).await?;
        }
    } else {
        let source = PartSource::Object {
            target: job.source_target_id.clone(),
            bucket: job.source_bucket.clone(),
            key: item.source_key.clone(),
        };
        let dest = ObjectRef {
            target: &job.dest_target_id,
            bucket: &job.dest_bucket,
            key: &item.dest_key,
        };
        let transfer = Transfer {
            storage: inner.storage.as_ref(),
            store: inner.store.as_ref(),
            config: &inner.config,
            cancel: &control.cancel,
        };
        transfer
            .upload(&item.id, &source, dest, item.size, &NoProgress)
            .await?;
    }
    Ok(ItemOutcome::Completed)
}

/// Server-side copies keep a single-part ETag; compare it when we have one.
async fn verify_copy(inner: &CloneInner, job: &CloneJob, item: &CloneJobItem) -> EngineResult<()> {
    let Some(expected) = item.source_etag.as_deref().filter(|etag| is_plain_md5(etag)) else {
        return Ok(());
    };
    let copied = inner
        .storage
        .head_object(&job.dest_target_id, &job.dest_bucket, &item.dest_key)
        .await?;
    let actual = copied.and_then(|entry| entry.etag).unwrap_or_default();
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(EngineError::ChecksumMismatch {
            key: item.dest_key.clone(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Copy one claimed item and record how it left `active`. Holds its pool
/// slot until the outcome is persisted.
async fn run_item(
    inner: Arc<CloneInner>,
    job: Arc<CloneJob>,
    item: CloneJobItem,
    control: Arc<JobControl>,
    _permit: OwnedSemaphorePermit,
) {
    let outcome = match copy_item(&inner, &job, &item, &control).await {
        Ok(outcome) => outcome,
        Err(EngineError::Cancelled) => ItemOutcome::Released,
        Err(e) if e.is_retryable() && item.retry_count < inner.config.clone_item_max_retries => {
            warn!(
                "clone_item_retry: {} key={} attempt={} error={}",
                item.id,
                item.source_key,
                item.retry_count + 1,
                e
            );
            tokio::time::sleep(inner.config.backoff(item.retry_count)).await;
            ItemOutcome::Retry(e.to_string())
        }
        Err(e) => {
            error!(
                "clone_item_failed: {} key={} error={}",
                item.id, item.source_key, e
            );
            discard_session(inner.storage.as_ref(), inner.store.as_ref(), &item.id).await;
            ItemOutcome::Failed(e.to_string())
        }
    };

    match inner.store.finish_clone_item(&item.id, &outcome).await {
        Ok(true) => debug!("clone_item_done: {} key={} outcome={:?}", item.id, item.source_key, outcome),
        Ok(false) => warn!("clone_item_finish_skipped: {} not active", item.id),
        Err(e) => error!("clone_item_finish_failed: {} error={}", item.id, e),
    }
    state::publish_progress(&inner, &job.id, Some(item.source_key), false).await;
}

fn log_join_error(job_id: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("clone_item_task_failed: {} error={}", job_id, e);
    }
}

/// Feed pending items into the shared slot pool until the job runs out of
/// work or is told to stop.
async fn schedule_items(
    inner: &Arc<CloneInner>,
    job: &Arc<CloneJob>,
    control: &Arc<JobControl>,
    in_flight: &mut JoinSet<()>,
) -> EngineResult<JobEnd> {
    loop {
        while let Some(Some(joined)) = in_flight.join_next().now_or_never() {
            log_join_error(&job.id, joined);
        }
        if control.is_cancelled() {
            return Ok(JobEnd::Stopped);
        }
        if control.is_paused() {
            return Ok(JobEnd::Paused);
        }

        let permit = tokio::select! {
            biased;
            _ = control.wake.notified() => continue,
            permit = inner.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(JobEnd::Stopped),
            },
        };
        if control.is_cancelled() || control.is_paused() {
            continue;
        }

        let next = inner.store.next_pending_clone_items(&job.id, 1).await?;
        let Some(item) = next.into_iter().next() else {
            drop(permit);
            if in_flight.is_empty() {
                return Ok(JobEnd::Completed);
            }
            // Retried items come back as pending when their task ends.
            tokio::select! {
                biased;
                _ = control.wake.notified() => {}
                Some(joined) = in_flight.join_next() => log_join_error(&job.id, joined),
            }
            continue;
        };
        if !inner.store.claim_clone_item(&item.id).await? {
            continue;
        }
        debug!("clone_item_start: {} key={}", item.id, item.source_key);
        in_flight.spawn(run_item(
            inner.clone(),
            job.clone(),
            item,
            control.clone(),
            permit,
        ));
    }
}

async fn execute_items(
    inner: &Arc<CloneInner>,
    job: Arc<CloneJob>,
    control: &Arc<JobControl>,
) -> EngineResult<JobEnd> {
    let mut in_flight = JoinSet::new();
    let scheduled = schedule_items(inner, &job, control, &mut in_flight).await;
    // In-flight copies always finish; a half-written object is worse than a slow pause.
    while let Some(joined) = in_flight.join_next().await {
        log_join_error(&job.id, joined);
    }
    scheduled
}

async fn run_job(
    inner: &Arc<CloneInner>,
    job_id: &str,
    control: &Arc<JobControl>,
) -> EngineResult<JobEnd> {
    let job = inner.job(job_id).await?;
    if !job.enumeration_complete {
        match enumerate(inner, &job, control).await? {
            EnumerationEnd::Complete => {}
            EnumerationEnd::Paused => return Ok(JobEnd::Paused),
            EnumerationEnd::Stopped => return Ok(JobEnd::Stopped),
        }
    }
    state::transition(
        inner,
        job_id,
        &[CloneJobStatus::Enumerating],
        CloneJobStatus::Running,
        None,
    )
    .await?;

    let job = inner.job(job_id).await?;
    if job.status != CloneJobStatus::Running {
        debug!("clone_driver_yield: {} status={}", job_id, job.status);
        return Ok(JobEnd::Stopped);
    }
    execute_items(inner, Arc::new(job), control).await
}

/// Driver task of one live job.
pub(super) async fn drive_job(inner: Arc<CloneInner>, job_id: String, control: Arc<JobControl>) {
    info!("clone_driver_start: {}", job_id);
    let result = run_job(&inner, &job_id, &control).await;
    // Before any status change, so a resume after `paused` gets a fresh driver.
    inner.release_control(&job_id, &control);

    let settled = match result {
        Ok(JobEnd::Completed) => {
            state::transition(
                &inner,
                &job_id,
                &[CloneJobStatus::Running],
                CloneJobStatus::Completed,
                None,
            )
            .await
        }
        Ok(JobEnd::Paused) => {
            state::transition(
                &inner,
                &job_id,
                &[CloneJobStatus::Enumerating, CloneJobStatus::Running],
                CloneJobStatus::Paused,
                None,
            )
            .await
        }
        Ok(JobEnd::Stopped) => Ok(false),
        Err(e) => {
            error!("clone_job_failed: {} error={}", job_id, e);
            state::transition(
                &inner,
                &job_id,
                &CloneJobStatus::LIVE,
                CloneJobStatus::Failed,
                Some(e.to_string()),
            )
            .await
        }
    };
    if let Err(e) = settled {
        error!("clone_driver_status_failed: {} error={}", job_id, e);
    }

    state::publish_progress(&inner, &job_id, None, true).await;
    match inner.store.get_clone_job(&job_id).await {
        Ok(Some(job)) if !job.status.is_terminal() => {}
        _ => inner.tracker.forget(&job_id),
    }
    info!("clone_driver_stop: {}", job_id);
}
