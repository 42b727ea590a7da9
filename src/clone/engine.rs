use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

use crate::config::EngineConfig;
use crate::db::Store;
use crate::error::{EngineError, EngineResult};
use crate::events::{CloneJobDeleted, EngineEvent, EventBus};
use crate::model::{
    new_id, now_millis, CloneItemStatus, CloneJob, CloneJobItem, CloneJobStatus, CloneRequest,
};
use crate::multipart::discard_session;
use crate::progress::ProgressTracker;
use crate::storage::StorageClient;

use super::worker::drive_job;
use super::{scope, state};

/// Pause/cancel requests for the driver of one job.
#[derive(Default)]
pub(super) struct JobControl {
    pub(super) pause: AtomicBool,
    pub(super) cancel: AtomicBool,
    pub(super) wake: Notify,
}

impl JobControl {
    pub(super) fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub(super) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

pub(super) struct CloneInner {
    pub(super) store: Arc<dyn Store>,
    pub(super) storage: Arc<dyn StorageClient>,
    pub(super) config: EngineConfig,
    pub(super) events: Arc<EventBus>,
    pub(super) tracker: ProgressTracker,
    /// Item copy slots shared by every job.
    pub(super) slots: Arc<Semaphore>,
    controls: Mutex<HashMap<String, Arc<JobControl>>>,
}

impl CloneInner {
    pub(super) async fn job(&self, job_id: &str) -> EngineResult<CloneJob> {
        self.store
            .get_clone_job(job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("clone job", job_id))
    }

    fn control(&self, job_id: &str) -> Option<Arc<JobControl>> {
        let controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        controls.get(job_id).cloned()
    }

    pub(super) fn release_control(&self, job_id: &str, control: &Arc<JobControl>) {
        let mut controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        if controls
            .get(job_id)
            .is_some_and(|current| Arc::ptr_eq(current, control))
        {
            controls.remove(job_id);
        }
    }

    /// Start a driver unless the job already has one.
    fn spawn_driver(self: &Arc<Self>, job_id: &str) -> bool {
        let control = {
            let mut controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
            if controls.contains_key(job_id) {
                debug!("clone_driver_exists: {}", job_id);
                return false;
            }
            let control = Arc::new(JobControl::default());
            controls.insert(job_id.to_string(), control.clone());
            control
        };
        tokio::spawn(drive_job(self.clone(), job_id.to_string(), control));
        true
    }

    /// Status a driver should pick the job up in.
    fn resume_status(job: &CloneJob) -> CloneJobStatus {
        if job.enumeration_complete {
            CloneJobStatus::Running
        } else {
            CloneJobStatus::Enumerating
        }
    }
}

/// Runs clone jobs. Cloning is cheap; clones share drivers and slots.
#[derive(Clone)]
pub struct CloneEngine {
    inner: Arc<CloneInner>,
}

impl CloneEngine {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn StorageClient>,
        config: EngineConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrent_clone_items.max(1)));
        Self {
            inner: Arc::new(CloneInner {
                store,
                storage,
                config,
                events,
                tracker: ProgressTracker::new(),
                slots,
                controls: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validate, persist and start a job. Rejected requests leave no record.
    pub async fn start(&self, request: CloneRequest) -> EngineResult<CloneJob> {
        scope::validate_request(&request)?;

        let now = now_millis();
        let job = CloneJob {
            id: new_id(),
            status: CloneJobStatus::Pending,
            is_same_target: request.source_target_id == request.dest_target_id,
            source_target_id: request.source_target_id,
            source_bucket: request.source_bucket,
            source_prefix: request.source_prefix,
            dest_target_id: request.dest_target_id,
            dest_bucket: request.dest_bucket,
            dest_prefix: request.dest_prefix,
            conflict_policy: request.conflict_policy,
            enumeration_token: None,
            enumeration_complete: false,
            total_items: 0,
            completed_items: 0,
            failed_items: 0,
            skipped_items: 0,
            total_bytes: 0,
            transferred_bytes: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.inner.store.insert_clone_job(&job).await?;
        info!(
            "clone_start: {} {}:{}/{} -> {}:{}/{} policy={} same_target={}",
            job.id,
            job.source_target_id,
            job.source_bucket,
            job.source_prefix,
            job.dest_target_id,
            job.dest_bucket,
            job.dest_prefix,
            job.conflict_policy,
            job.is_same_target
        );

        state::transition(
            &self.inner,
            &job.id,
            &[CloneJobStatus::Pending],
            CloneJobStatus::Enumerating,
            None,
        )
        .await?;
        self.inner.spawn_driver(&job.id);
        self.inner.job(&job.id).await
    }

    pub async fn get(&self, job_id: &str) -> EngineResult<CloneJob> {
        self.inner.job(job_id).await
    }

    /// Newest first.
    pub async fn list(&self) -> EngineResult<Vec<CloneJob>> {
        Ok(self.inner.store.list_clone_jobs().await?)
    }

    pub async fn items(&self, job_id: &str) -> EngineResult<Vec<CloneJobItem>> {
        self.inner.job(job_id).await?;
        Ok(self.inner.store.list_clone_items(job_id).await?)
    }

    /// Stop scheduling new work. Returns at once; the job reads `paused`
    /// after in-flight copies have drained.
    pub async fn pause(&self, job_id: &str) -> EngineResult<CloneJob> {
        let job = self.inner.job(job_id).await?;
        if !matches!(
            job.status,
            CloneJobStatus::Enumerating | CloneJobStatus::Running
        ) {
            return Err(EngineError::invalid_transition(
                "clone job",
                "pause",
                job.status,
            ));
        }

        match self.inner.control(job_id) {
            Some(control) => {
                info!("clone_pause_requested: {}", job_id);
                control.request_pause();
            }
            None => {
                // No driver (not recovered yet): nothing to drain.
                state::transition(
                    &self.inner,
                    job_id,
                    &[CloneJobStatus::Enumerating, CloneJobStatus::Running],
                    CloneJobStatus::Paused,
                    None,
                )
                .await?;
            }
        }
        self.inner.job(job_id).await
    }

    /// Continue a paused job from its persisted cursor and pending items.
    pub async fn resume(&self, job_id: &str) -> EngineResult<CloneJob> {
        let job = self.inner.job(job_id).await?;
        if job.status != CloneJobStatus::Paused {
            return Err(EngineError::invalid_transition(
                "clone job",
                "resume",
                job.status,
            ));
        }
        let target = CloneInner::resume_status(&job);
        if !state::transition(
            &self.inner,
            job_id,
            &[CloneJobStatus::Paused],
            target,
            None,
        )
        .await?
        {
            let current = self.inner.job(job_id).await?;
            return Err(EngineError::invalid_transition(
                "clone job",
                "resume",
                current.status,
            ));
        }
        self.inner.spawn_driver(job_id);
        self.inner.job(job_id).await
    }

    /// Stop enumeration and scheduling. Objects already copied stay; items
    /// not yet copied stay `pending`.
    pub async fn cancel(&self, job_id: &str) -> EngineResult<CloneJob> {
        let job = self.inner.job(job_id).await?;
        if job.status.is_terminal() {
            return Err(EngineError::invalid_transition(
                "clone job",
                "cancel",
                job.status,
            ));
        }
        if let Some(control) = self.inner.control(job_id) {
            control.request_cancel();
        }
        if !state::transition(
            &self.inner,
            job_id,
            &CloneJobStatus::NON_TERMINAL,
            CloneJobStatus::Cancelled,
            None,
        )
        .await?
        {
            let current = self.inner.job(job_id).await?;
            return Err(EngineError::invalid_transition(
                "clone job",
                "cancel",
                current.status,
            ));
        }
        self.inner.tracker.forget(job_id);
        self.inner.job(job_id).await
    }

    /// Put every failed item back to `pending`. Finished jobs start running
    /// again; a paused job stays paused until resumed.
    pub async fn retry_failed(&self, job_id: &str) -> EngineResult<CloneJob> {
        let job = self.inner.job(job_id).await?;
        if !matches!(
            job.status,
            CloneJobStatus::Completed | CloneJobStatus::Failed | CloneJobStatus::Paused
        ) {
            return Err(EngineError::invalid_transition(
                "clone job",
                "retry",
                job.status,
            ));
        }

        let reset = self.inner.store.reset_failed_clone_items(job_id).await?;
        info!("clone_retry_failed: {} reset={}", job_id, reset);
        if job.status == CloneJobStatus::Paused {
            return self.inner.job(job_id).await;
        }
        if reset == 0 && job.enumeration_complete {
            debug!("clone_retry_failed: {} nothing to retry", job_id);
            return self.inner.job(job_id).await;
        }

        let target = CloneInner::resume_status(&job);
        if state::transition(
            &self.inner,
            job_id,
            &[CloneJobStatus::Completed, CloneJobStatus::Failed],
            target,
            None,
        )
        .await?
        {
            self.inner.spawn_driver(job_id);
        }
        self.inner.job(job_id).await
    }

    /// Remove a finished job with all of its items.
    pub async fn delete(&self, job_id: &str) -> EngineResult<()> {
        let job = self.inner.job(job_id).await?;
        if !job.status.is_terminal() {
            return Err(EngineError::invalid_transition(
                "clone job",
                "delete",
                job.status,
            ));
        }

        let items = self.inner.store.list_clone_items(job_id).await?;
        for item in items.iter().filter(|item| {
            !matches!(
                item.status,
                CloneItemStatus::Completed | CloneItemStatus::Skipped
            )
        }) {
            discard_session(self.inner.storage.as_ref(), self.inner.store.as_ref(), &item.id)
                .await;
        }
        self.inner.store.delete_clone_job(job_id).await?;
        self.inner.tracker.forget(job_id);
        info!("clone_job_deleted: {} items={}", job_id, items.len());
        self.inner
            .events
            .publish(EngineEvent::CloneJobDeleted(CloneJobDeleted {
                job_id: job_id.to_string(),
            }));
        Ok(())
    }

    /// Start-up recovery: interrupted items go back to `pending` and every
    /// live job gets a driver. Paused jobs stay paused.
    pub(crate) async fn recover(&self) -> EngineResult<usize> {
        let reset = self.inner.store.reset_interrupted_clone_items().await?;
        if reset > 0 {
            warn!("clone_recover: released {} interrupted items", reset);
        }
        let mut resumed = 0;
        for job in self.inner.store.list_clone_jobs().await? {
            if !CloneJobStatus::LIVE.contains(&job.status) {
                continue;
            }
            if job.status == CloneJobStatus::Pending {
                state::transition(
                    &self.inner,
                    &job.id,
                    &[CloneJobStatus::Pending],
                    CloneJobStatus::Enumerating,
                    None,
                )
                .await?;
            }
            if self.inner.spawn_driver(&job.id) {
                resumed += 1;
            }
        }
        info!("clone_recover: resumed={}", resumed);
        Ok(resumed)
    }
}
