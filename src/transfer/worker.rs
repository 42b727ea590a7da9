use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, TransferProgress};
use crate::model::{TransferDirection, TransferQueueItem, TransferStatus};
use crate::multipart::{discard_session, ObjectRef, PartSource, ProgressSink, Transfer};

use super::queue::QueueInner;

/// Persists and publishes the byte count of one active item.
struct QueueProgress<'a> {
    inner: &'a QueueInner,
    id: &'a str,
    total: u64,
}

#[async_trait]
impl ProgressSink for QueueProgress<'_> {
    async fn report(&self, transferred: u64) {
        // Equality with the total is reserved for `completed`.
        let transferred = transferred.min(self.total.saturating_sub(1));
        if let Err(e) = self
            .inner
            .store
            .update_transfer_progress(self.id, transferred)
            .await
        {
            warn!("transfer_progress_persist_failed: {} error={}", self.id, e);
        }
        let interval = self.inner.config.progress_interval();
        if let Some(sample) =
            self.inner
                .tracker
                .sample_if_due(self.id, transferred, Some(self.total), interval, false)
        {
            self.inner
                .events
                .publish(EngineEvent::TransferProgress(TransferProgress {
                    id: self.id.to_string(),
                    status: TransferStatus::Active,
                    transferred_bytes: transferred,
                    total_bytes: Some(self.total),
                    speed: sample.speed,
                    eta_seconds: sample.eta_seconds,
                }));
        }
    }
}

fn required_path<'a>(path: &'a Option<String>, what: &str) -> EngineResult<&'a Path> {
    path.as_deref()
        .map(Path::new)
        .ok_or_else(|| EngineError::InvalidTransferSpec(format!("Missing {}", what)))
}

fn measured_total(item: &TransferQueueItem, actual: u64) -> u64 {
    if let Some(declared) = item.total_bytes.filter(|declared| *declared != actual) {
        warn!(
            "transfer_size_corrected: {} declared={} actual={}",
            item.id, declared, actual
        );
    }
    actual
}

/// Size of the source as it is now, plus the object ETag for downloads.
/// A size declared at enqueue time is only a hint.
async fn probe(inner: &QueueInner, item: &TransferQueueItem) -> EngineResult<(u64, Option<String>)> {
    match item.direction {
        TransferDirection::Upload => {
            let path = required_path(&item.source_path, "source path")?;
            let metadata = tokio::fs::metadata(path).await?;
            Ok((measured_total(item, metadata.len()), None))
        }
        TransferDirection::Download => {
            let entry = inner
                .storage
                .head_object(&item.target_id, &item.bucket, &item.key)
                .await?
                .ok_or_else(|| {
                    EngineError::Storage(format!("Object not found: {}/{}", item.bucket, item.key))
                })?;
            Ok((measured_total(item, entry.size), entry.etag))
        }
    }
}

async fn execute(
    inner: &QueueInner,
    item: &TransferQueueItem,
    cancel: &AtomicBool,
) -> EngineResult<u64> {
    let (total, etag) = probe(inner, item).await?;
    inner.store.set_transfer_total(&item.id, total).await?;

    let sink = QueueProgress {
        inner,
        id: &item.id,
        total,
    };
    let transfer = Transfer {
        storage: inner.storage.as_ref(),
        store: inner.store.as_ref(),
        config: &inner.config,
        cancel,
    };
    let object = ObjectRef {
        target: &item.target_id,
        bucket: &item.bucket,
        key: &item.key,
    };
    match item.direction {
        TransferDirection::Upload => {
            let path = required_path(&item.source_path, "source path")?;
            let source = PartSource::File(PathBuf::from(path));
            transfer.upload(&item.id, &source, object, total, &sink).await?;
        }
        TransferDirection::Download => {
            let path = required_path(&item.destination_path, "destination path")?;
            transfer
                .download(&item.id, object, path, total, etag.as_deref(), &sink)
                .await?;
        }
    }
    Ok(total)
}

/// Runs [`execute`] until it succeeds, fails for good, or runs out of
/// automatic retries.
async fn execute_with_retry(
    inner: &QueueInner,
    item: &TransferQueueItem,
    cancel: &AtomicBool,
) -> EngineResult<u64> {
    let mut attempt = item.retry_count;
    loop {
        match execute(inner, item, cancel).await {
            Ok(total) => return Ok(total),
            Err(e)
                if e.is_retryable()
                    && inner.config.auto_retry
                    && attempt < inner.config.retry_count =>
            {
                let message = e.to_string();
                let retries = inner.store.record_transfer_retry(&item.id, &message).await?;
                warn!(
                    "transfer_retry: {} attempt={} error={}",
                    item.id, retries, message
                );
                tokio::time::sleep(inner.config.backoff(attempt)).await;
                attempt += 1;
                if cancel.load(Ordering::SeqCst) {
                    return Err(EngineError::Cancelled);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Worker task for one active item. Always frees its slot by waking the
/// pump on the way out.
pub(super) async fn run_transfer(
    inner: Arc<QueueInner>,
    item: TransferQueueItem,
    cancel: Arc<AtomicBool>,
) {
    let id = item.id.clone();
    info!(
        "transfer_start: {} {} {}/{} retry={}",
        id, item.direction, item.bucket, item.key, item.retry_count
    );

    let mut result = execute_with_retry(&inner, &item, &cancel).await;
    if cancel.load(Ordering::SeqCst) {
        // A cancel that landed during the last write wins over its result.
        result = Err(EngineError::Cancelled);
    }

    match result {
        Ok(total) => match inner.store.complete_transfer(&id).await {
            Ok(true) => {
                info!("transfer_complete: {} bytes={}", id, total);
                let sample = inner
                    .tracker
                    .sample_if_due(&id, total, Some(total), inner.config.progress_interval(), true)
                    .unwrap_or_default();
                match inner.store.get_transfer(&id).await {
                    Ok(Some(done)) => {
                        let mut progress = TransferProgress::from_item(&done, sample);
                        progress.eta_seconds = Some(0);
                        inner.events.publish(EngineEvent::TransferProgress(progress));
                    }
                    Ok(None) => debug!("transfer_complete_removed: {}", id),
                    Err(e) => warn!("transfer_complete_lookup_failed: {} error={}", id, e),
                }
                inner.publish_status(&id, TransferStatus::Completed, None);
            }
            Ok(false) => debug!("transfer_complete_skipped: {} no longer active", id),
            Err(e) => error!("transfer_complete_failed: {} error={}", id, e),
        },
        Err(EngineError::Cancelled) => {
            info!("transfer_cancelled: {}", id);
            // A retry may already have handed the item to a new worker.
            let still_cancelled = matches!(
                inner.store.get_transfer(&id).await,
                Ok(Some(current)) if current.status == TransferStatus::Cancelled
            );
            if still_cancelled {
                discard_session(inner.storage.as_ref(), inner.store.as_ref(), &id).await;
            }
        }
        Err(e) => {
            let message = e.to_string();
            error!("transfer_failed: {} error={}", id, message);
            discard_session(inner.storage.as_ref(), inner.store.as_ref(), &id).await;
            match inner
                .store
                .transition_transfer(
                    &id,
                    &[TransferStatus::Active],
                    TransferStatus::Failed,
                    Some(&message),
                )
                .await
            {
                Ok(true) => inner.publish_status(&id, TransferStatus::Failed, Some(message)),
                Ok(false) => debug!("transfer_fail_skipped: {} no longer active", id),
                Err(db_err) => error!("transfer_fail_persist_failed: {} error={}", id, db_err),
            }
        }
    }

    inner.tracker.forget(&id);
    inner.release_cancel_flag(&id, &cancel);
    inner.release_worker(&id);
    inner.schedule(item.direction);
}
