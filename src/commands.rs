//! Command boundary consumed by the UI
//!
//! [`Engine`] wires the store, the storage client and the event bus into the
//! transfer queue and the clone engine, and exposes one method per UI
//! command. List commands read straight from the store so a client can
//! always resync after missing events.

use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::clone::CloneEngine;
use crate::config::EngineConfig;
use crate::db::{Store, TursoStore};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventSubscription};
use crate::model::{CloneJob, CloneJobItem, CloneRequest, EnqueueRequest, TransferQueueItem};
use crate::storage::{CredentialProvider, S3Storage, StorageClient};
use crate::transfer::TransferQueue;

/// Longest lifetime S3 accepts for a presigned URL (7 days).
const MAX_PRESIGN_SECS: u64 = 7 * 24 * 60 * 60;

pub struct Engine {
    storage: Arc<dyn StorageClient>,
    events: Arc<EventBus>,
    transfers: TransferQueue,
    clones: CloneEngine,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, storage: Arc<dyn StorageClient>, config: EngineConfig) -> Self {
        let events = Arc::new(EventBus::new(
            config.status_event_capacity,
            config.progress_event_capacity,
        ));
        let transfers = TransferQueue::new(
            store.clone(),
            storage.clone(),
            config.clone(),
            events.clone(),
        );
        let clones = CloneEngine::new(store, storage.clone(), config, events.clone());
        Self {
            storage,
            events,
            transfers,
            clones,
        }
    }

    /// Production wiring: turso database at `db_path`, S3 over `aws-sdk-s3`.
    pub async fn open(
        db_path: &Path,
        credentials: Arc<dyn CredentialProvider>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = TursoStore::open(db_path).await?;
        info!("engine_open: {}", db_path.display());
        Ok(Self::new(
            Arc::new(store),
            Arc::new(S3Storage::new(credentials)),
            config,
        ))
    }

    /// Resume work interrupted by the previous shutdown. Call once at start-up.
    pub async fn recover(&self) -> EngineResult<()> {
        let transfers = self.transfers.recover().await?;
        let jobs = self.clones.recover().await?;
        info!(
            "engine_recover: transfers_requeued={} clone_jobs_resumed={}",
            transfers, jobs
        );
        Ok(())
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn transfers(&self) -> &TransferQueue {
        &self.transfers
    }

    pub fn clones(&self) -> &CloneEngine {
        &self.clones
    }

    // Transfer queue

    pub async fn transfer_queue_list(&self) -> EngineResult<Vec<TransferQueueItem>> {
        self.transfers.list().await
    }

    pub async fn transfer_queue_upsert(
        &self,
        item: TransferQueueItem,
    ) -> EngineResult<TransferQueueItem> {
        self.transfers.upsert(item).await
    }

    pub async fn transfer_queue_delete(&self, id: &str) -> EngineResult<()> {
        self.transfers.remove(id).await
    }

    pub async fn transfer_queue_clear_terminal(&self) -> EngineResult<u64> {
        self.transfers.clear_terminal().await
    }

    pub async fn transfer_queue_enqueue(
        &self,
        request: EnqueueRequest,
    ) -> EngineResult<TransferQueueItem> {
        self.transfers.enqueue(request).await
    }

    pub async fn transfer_queue_cancel(&self, id: &str) -> EngineResult<TransferQueueItem> {
        self.transfers.cancel(id).await
    }

    pub async fn transfer_queue_retry(&self, id: &str) -> EngineResult<TransferQueueItem> {
        self.transfers.retry(id).await
    }

    // Clone jobs

    pub async fn clone_start(&self, request: CloneRequest) -> EngineResult<CloneJob> {
        self.clones.start(request).await
    }

    pub async fn clone_job_list(&self) -> EngineResult<Vec<CloneJob>> {
        self.clones.list().await
    }

    pub async fn clone_job_get(&self, job_id: &str) -> EngineResult<CloneJob> {
        self.clones.get(job_id).await
    }

    pub async fn clone_job_items(&self, job_id: &str) -> EngineResult<Vec<CloneJobItem>> {
        self.clones.items(job_id).await
    }

    pub async fn clone_pause(&self, job_id: &str) -> EngineResult<CloneJob> {
        self.clones.pause(job_id).await
    }

    pub async fn clone_resume(&self, job_id: &str) -> EngineResult<CloneJob> {
        self.clones.resume(job_id).await
    }

    pub async fn clone_cancel(&self, job_id: &str) -> EngineResult<CloneJob> {
        self.clones.cancel(job_id).await
    }

    pub async fn clone_job_delete(&self, job_id: &str) -> EngineResult<()> {
        self.clones.delete(job_id).await
    }

    pub async fn clone_retry_failed(&self, job_id: &str) -> EngineResult<CloneJob> {
        self.clones.retry_failed(job_id).await
    }

    // Objects

    /// Time-limited GET URL for one object.
    pub async fn object_presign(
        &self,
        target_id: &str,
        bucket: &str,
        key: &str,
        ttl_secs: u64,
    ) -> EngineResult<String> {
        if bucket.is_empty() || key.is_empty() {
            return Err(EngineError::InvalidInput(
                "Bucket and key are required".to_string(),
            ));
        }
        if ttl_secs == 0 || ttl_secs > MAX_PRESIGN_SECS {
            return Err(EngineError::InvalidInput(format!(
                "Presign lifetime must be between 1 and {} seconds, got {}",
                MAX_PRESIGN_SECS, ttl_secs
            )));
        }
        let url = self
            .storage
            .presign_get(target_id, bucket, key, Duration::from_secs(ttl_secs))
            .await
            .map_err(|e| {
                warn!("object_presign_failed: {}/{} error={}", bucket, key, e);
                EngineError::from(e)
            })?;
        Ok(url)
    }
}
