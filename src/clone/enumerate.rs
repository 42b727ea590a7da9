use log::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::{new_id, now_millis, CloneItemStatus, CloneJob, CloneJobItem};
use crate::storage::{ListPage, ObjectEntry};

use super::engine::{CloneInner, JobControl};
use super::{scope, state};

pub(super) enum EnumerationEnd {
    Complete,
    Paused,
    Stopped,
}

fn plan_item(job: &CloneJob, entry: &ObjectEntry, now: i64) -> Option<CloneJobItem> {
    let Some(dest_key) = scope::dest_key(&job.source_prefix, &job.dest_prefix, &entry.key) else {
        warn!(
            "clone_enumerate_foreign_key: {} key={} prefix={}",
            job.id, entry.key, job.source_prefix
        );
        return None;
    };
    Some(CloneJobItem {
        id: new_id(),
        job_id: job.id.clone(),
        source_key: entry.key.clone(),
        dest_key,
        size: entry.size,
        source_etag: entry.etag.clone(),
        source_last_modified: entry.last_modified,
        status: CloneItemStatus::Pending,
        error_message: None,
        retry_count: 0,
        created_at: now,
        updated_at: now,
    })
}

async fn list_page(
    inner: &CloneInner,
    job: &CloneJob,
    token: Option<&str>,
) -> EngineResult<ListPage> {
    let max_retries = inner.config.enumeration_max_retries;
    let mut attempt = 0;
    loop {
        match inner
            .storage
            .list_objects(&job.source_target_id, &job.source_bucket, &job.source_prefix, token)
            .await
        {
            Ok(page) => return Ok(page),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                warn!(
                    "clone_enumerate_retry: {} attempt={} error={}",
                    job.id,
                    attempt + 1,
                    e
                );
                tokio::time::sleep(inner.config.backoff(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(EngineError::EnumerationFailed(e.to_string())),
        }
    }
}

/// List the source scope from the persisted cursor onward, recording one
/// page per store transaction. Pause and cancel are honoured between pages.
pub(super) async fn enumerate(
    inner: &CloneInner,
    job: &CloneJob,
    control: &JobControl,
) -> EngineResult<EnumerationEnd> {
    let mut token = job.enumeration_token.clone();
    info!(
        "clone_enumerate_start: {} {}/{} resume={}",
        job.id,
        job.source_bucket,
        job.source_prefix,
        token.is_some()
    );

    let mut pages = 0u64;
    loop {
        if control.is_cancelled() {
            return Ok(EnumerationEnd::Stopped);
        }
        if control.is_paused() {
            return Ok(EnumerationEnd::Paused);
        }

        let page = list_page(inner, job, token.as_deref()).await?;
        let now = now_millis();
        let items: Vec<CloneJobItem> = page
            .entries
            .iter()
            .filter_map(|entry| plan_item(job, entry, now))
            .collect();
        let next_token = page.next_token.filter(|_| page.is_truncated);
        let complete = next_token.is_none();
        let added = inner
            .store
            .record_enumeration_page(&job.id, &items, next_token.as_deref(), complete)
            .await?;
        pages += 1;
        debug!(
            "clone_enumerate_page: {} page={} entries={} added={} complete={}",
            job.id,
            pages,
            items.len(),
            added,
            complete
        );
        state::publish_progress(inner, &job.id, None, complete).await;

        if complete {
            info!("clone_enumerate_complete: {} pages={}", job.id, pages);
            return Ok(EnumerationEnd::Complete);
        }
        token = next_token;
    }
}
