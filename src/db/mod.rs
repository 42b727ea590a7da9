//! Persistence for queue items, clone jobs/items and multipart sessions
//!
//! The store is the single source of truth: workers write every transition
//! through these traits and never keep state that could diverge from the
//! persisted record across a restart. [`TursoStore`] is the durable
//! implementation, [`MemoryStore`] keeps everything in process.

use async_trait::async_trait;
use std::path::Path;
use tokio::sync::Mutex;
use turso::{Builder, Connection};

use crate::model::{
    CloneItemStatus, CloneJob, CloneJobItem, CloneJobStatus, ItemOutcome, TransferDirection,
    TransferQueueItem, TransferStatus,
};

mod clone_jobs;
mod memory;
mod multipart;
mod transfer_queue;

pub use memory::MemoryStore;
pub use multipart::{MultipartSession, StoredPart};

// Custom error type for database operations
pub type DbResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[async_trait]
pub trait TransferRepository: Send + Sync {
    async fn insert_transfer(&self, item: &TransferQueueItem) -> DbResult<()>;

    async fn get_transfer(&self, id: &str) -> DbResult<Option<TransferQueueItem>>;

    /// Oldest first.
    async fn list_transfers(&self) -> DbResult<Vec<TransferQueueItem>>;

    async fn delete_transfer(&self, id: &str) -> DbResult<bool>;

    /// Removes every completed, failed and cancelled item.
    async fn delete_terminal_transfers(&self) -> DbResult<u64>;

    async fn count_active_transfers(&self, direction: TransferDirection) -> DbResult<u64>;

    /// Oldest `queued` items of one direction.
    async fn next_queued_transfers(
        &self,
        direction: TransferDirection,
        limit: usize,
    ) -> DbResult<Vec<TransferQueueItem>>;

    /// Compare-and-set on status. Terminal targets stamp `completed_at`; a
    /// `Some` error replaces `error_message`. Returns whether the row moved.
    async fn transition_transfer(
        &self,
        id: &str,
        from: &[TransferStatus],
        to: TransferStatus,
        error: Option<&str>,
    ) -> DbResult<bool>;

    /// Records the measured size of the source, replacing any declared one.
    async fn set_transfer_total(&self, id: &str, total_bytes: u64) -> DbResult<()>;

    /// Raises `transferred_bytes` of an active item; never lowers it.
    async fn update_transfer_progress(&self, id: &str, transferred_bytes: u64) -> DbResult<()>;

    /// `active -> completed` with `transferred_bytes = total_bytes`.
    async fn complete_transfer(&self, id: &str) -> DbResult<bool>;

    /// Back to `queued` from one of `from`, with progress, retries and error
    /// cleared and a fresh `created_at`.
    async fn requeue_transfer(&self, id: &str, from: &[TransferStatus]) -> DbResult<bool>;

    /// Counts one automatic retry of an active item.
    async fn record_transfer_retry(&self, id: &str, error: &str) -> DbResult<u32>;

    /// Start-up recovery: `active -> queued` with progress reset.
    async fn reset_interrupted_transfers(&self) -> DbResult<u64>;
}

#[async_trait]
pub trait CloneRepository: Send + Sync {
    async fn insert_clone_job(&self, job: &CloneJob) -> DbResult<()>;

    async fn get_clone_job(&self, id: &str) -> DbResult<Option<CloneJob>>;

    /// Newest first.
    async fn list_clone_jobs(&self) -> DbResult<Vec<CloneJob>>;

    /// Compare-and-set on job status. Terminal targets stamp `completed_at`,
    /// other targets clear it together with a stale `error_message`; a
    /// `Some` error replaces `error_message`.
    async fn transition_clone_job(
        &self,
        id: &str,
        from: &[CloneJobStatus],
        to: CloneJobStatus,
        error: Option<&str>,
    ) -> DbResult<bool>;

    /// Records one listing page atomically: inserts items whose source key
    /// is not yet known for the job, grows the job totals by what was
    /// inserted, and stores the continuation cursor. Returns the number of
    /// new items.
    async fn record_enumeration_page(
        &self,
        job_id: &str,
        items: &[CloneJobItem],
        next_token: Option<&str>,
        complete: bool,
    ) -> DbResult<u64>;

    async fn next_pending_clone_items(
        &self,
        job_id: &str,
        limit: usize,
    ) -> DbResult<Vec<CloneJobItem>>;

    /// `pending -> active`.
    async fn claim_clone_item(&self, item_id: &str) -> DbResult<bool>;

    /// Moves an active item out of `active` and updates the job counters in
    /// the same transaction.
    async fn finish_clone_item(&self, item_id: &str, outcome: &ItemOutcome) -> DbResult<bool>;

    async fn get_clone_item(&self, item_id: &str) -> DbResult<Option<CloneJobItem>>;

    async fn list_clone_items(&self, job_id: &str) -> DbResult<Vec<CloneJobItem>>;

    async fn count_clone_items(&self, job_id: &str, status: CloneItemStatus) -> DbResult<u64>;

    /// `failed -> pending` for every failed item of the job, with the job's
    /// `failed_items` lowered accordingly.
    async fn reset_failed_clone_items(&self, job_id: &str) -> DbResult<u64>;

    /// Start-up recovery: `active -> pending` across all jobs.
    async fn reset_interrupted_clone_items(&self) -> DbResult<u64>;

    /// Deletes the job and all of its items.
    async fn delete_clone_job(&self, id: &str) -> DbResult<bool>;
}

#[async_trait]
pub trait MultipartRepository: Send + Sync {
    async fn save_multipart_session(&self, session: &MultipartSession) -> DbResult<()>;

    /// The session with every part recorded so far.
    async fn get_multipart_session(&self, owner_id: &str) -> DbResult<Option<MultipartSession>>;

    async fn save_multipart_part(&self, owner_id: &str, part: &StoredPart) -> DbResult<()>;

    /// Removes the session and its parts.
    async fn delete_multipart_session(&self, owner_id: &str) -> DbResult<()>;
}

/// Everything the engine persists.
pub trait Store: TransferRepository + CloneRepository + MultipartRepository {}

impl<T> Store for T where T: TransferRepository + CloneRepository + MultipartRepository {}

/// Durable store on a local turso database.
pub struct TursoStore {
    // Wrap Connection in Mutex to serialize database access
    // turso has race conditions in its page cache when accessed concurrently
    conn: Mutex<Connection>,
}

impl TursoStore {
    /// Open (or create) the database file and make sure every table exists.
    pub async fn open(db_path: &Path) -> DbResult<Self> {
        let path = db_path
            .to_str()
            .ok_or_else(|| format!("Database path is not valid UTF-8: {}", db_path.display()))?;
        Self::open_at(path).await
    }

    pub async fn open_in_memory() -> DbResult<Self> {
        Self::open_at(":memory:").await
    }

    async fn open_at(path: &str) -> DbResult<Self> {
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;

        conn.execute_batch(transfer_queue::get_table_sql()).await?;
        conn.execute_batch(clone_jobs::get_table_sql()).await?;
        conn.execute_batch(multipart::get_table_sql()).await?;

        log::info!("db_open: {}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// `'a', 'b'` for an `IN (...)` clause. Values come from the status enums,
/// never from user input.
pub(crate) fn sql_in_list<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    values
        .into_iter()
        .map(|v| format!("'{}'", v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Rows touched by the previous statement on this connection.
pub(crate) async fn changes(conn: &Connection) -> DbResult<u64> {
    let mut rows = conn.query("SELECT changes()", turso::params![]).await?;
    if let Some(row) = rows.next().await? {
        Ok(row.get::<i64>(0)?.max(0) as u64)
    } else {
        Ok(0)
    }
}

pub(crate) fn to_db_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_db_int(value: i64) -> u64 {
    value.max(0) as u64
}
