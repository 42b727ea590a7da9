//! Push notifications for the UI
//!
//! Status changes and progress snapshots travel on separate broadcast
//! channels so a burst of progress can never evict a status change. Events
//! are a convenience on top of the list commands: a subscriber that lags
//! resyncs from the store.

use log::warn;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::model::{CloneJob, CloneJobStatus, TransferQueueItem, TransferStatus};
use crate::progress::ProgressSample;

pub const CLONE_PROGRESS: &str = "clone-progress";
pub const CLONE_STATUS_CHANGE: &str = "clone-status-change";
pub const CLONE_JOB_DELETED: &str = "clone-job-deleted";
pub const TRANSFER_PROGRESS: &str = "transfer-progress";
pub const TRANSFER_STATUS_CHANGE: &str = "transfer-status-change";
pub const TRANSFER_REMOVED: &str = "transfer-removed";

/// Snapshot of a clone job's counters.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloneProgress {
    pub job_id: String,
    pub status: CloneJobStatus,
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub current_key: Option<String>,
    pub speed: f64, // bytes per second
    pub eta_seconds: Option<u64>,
}

impl CloneProgress {
    pub fn from_job(job: &CloneJob, current_key: Option<String>, sample: ProgressSample) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            total_items: job.total_items,
            completed_items: job.completed_items,
            failed_items: job.failed_items,
            skipped_items: job.skipped_items,
            total_bytes: job.total_bytes,
            transferred_bytes: job.transferred_bytes,
            current_key,
            speed: sample.speed,
            eta_seconds: sample.eta_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloneStatusChanged {
    pub job_id: String,
    pub status: CloneJobStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloneJobDeleted {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub id: String,
    pub status: TransferStatus,
    pub transferred_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed: f64, // bytes per second
    pub eta_seconds: Option<u64>,
}

impl TransferProgress {
    pub fn from_item(item: &TransferQueueItem, sample: ProgressSample) -> Self {
        Self {
            id: item.id.clone(),
            status: item.status,
            transferred_bytes: item.transferred_bytes,
            total_bytes: item.total_bytes,
            speed: sample.speed,
            eta_seconds: sample.eta_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatusChanged {
    pub id: String,
    pub status: TransferStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferRemoved {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    CloneProgress(CloneProgress),
    CloneStatusChanged(CloneStatusChanged),
    CloneJobDeleted(CloneJobDeleted),
    TransferProgress(TransferProgress),
    TransferStatusChanged(TransferStatusChanged),
    TransferRemoved(TransferRemoved),
}

impl EngineEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            EngineEvent::CloneProgress(_) => CLONE_PROGRESS,
            EngineEvent::CloneStatusChanged(_) => CLONE_STATUS_CHANGE,
            EngineEvent::CloneJobDeleted(_) => CLONE_JOB_DELETED,
            EngineEvent::TransferProgress(_) => TRANSFER_PROGRESS,
            EngineEvent::TransferStatusChanged(_) => TRANSFER_STATUS_CHANGE,
            EngineEvent::TransferRemoved(_) => TRANSFER_REMOVED,
        }
    }

    /// Progress snapshots may be coalesced or dropped; everything else may not.
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            EngineEvent::CloneProgress(_) | EngineEvent::TransferProgress(_)
        )
    }

    /// Id of the job or transfer item the event is about.
    pub fn subject_id(&self) -> &str {
        match self {
            EngineEvent::CloneProgress(e) => &e.job_id,
            EngineEvent::CloneStatusChanged(e) => &e.job_id,
            EngineEvent::CloneJobDeleted(e) => &e.job_id,
            EngineEvent::TransferProgress(e) => &e.id,
            EngineEvent::TransferStatusChanged(e) => &e.id,
            EngineEvent::TransferRemoved(e) => &e.id,
        }
    }
}

/// Broadcast-based event bus.
pub struct EventBus {
    status_tx: broadcast::Sender<EngineEvent>,
    progress_tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(status_capacity: usize, progress_capacity: usize) -> Self {
        let (status_tx, _) = broadcast::channel(status_capacity.max(1));
        let (progress_tx, _) = broadcast::channel(progress_capacity.max(1));
        Self {
            status_tx,
            progress_tx,
        }
    }

    /// Publish an event. If there are no subscribers the event is dropped silently.
    pub fn publish(&self, event: EngineEvent) {
        if event.is_progress() {
            let _ = self.progress_tx.send(event);
        } else {
            let _ = self.status_tx.send(event);
        }
    }

    pub fn clone_status(&self, job_id: &str, status: CloneJobStatus, error: Option<String>) {
        self.publish(EngineEvent::CloneStatusChanged(CloneStatusChanged {
            job_id: job_id.to_string(),
            status,
            error,
        }));
    }

    pub fn transfer_status(&self, id: &str, status: TransferStatus, error: Option<String>) {
        self.publish(EngineEvent::TransferStatusChanged(TransferStatusChanged {
            id: id.to_string(),
            status,
            error,
        }));
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            status_rx: self.status_tx.subscribe(),
            progress_rx: self.progress_tx.subscribe(),
        }
    }
}

pub struct EventSubscription {
    status_rx: broadcast::Receiver<EngineEvent>,
    progress_rx: broadcast::Receiver<EngineEvent>,
}

impl EventSubscription {
    /// Next event, status changes first. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            tokio::select! {
                biased;
                result = self.status_rx.recv() => match result {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("event_bus_lagged: status events missed={}", missed);
                    }
                    Err(RecvError::Closed) => return None,
                },
                result = self.progress_rx.recv() => match result {
                    Ok(event) => return Some(event),
                    // Snapshots are superseded by newer ones.
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }
}
