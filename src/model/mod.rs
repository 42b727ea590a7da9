//! Queue, job and item records shared by the engine, the store and the UI

mod clone;
mod transfer;

pub use clone::{
    CloneItemStatus, CloneJob, CloneJobItem, CloneJobStatus, CloneRequest, ConflictPolicy,
    ItemOutcome,
};
pub use transfer::{EnqueueRequest, TransferDirection, TransferQueueItem, TransferStatus};

/// Milliseconds since the Unix epoch; all record timestamps use this unit.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
