use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;
use crate::db::Store;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus, TransferRemoved};
use crate::model::{
    new_id, now_millis, EnqueueRequest, TransferDirection, TransferQueueItem, TransferStatus,
};
use crate::multipart::discard_session;
use crate::progress::ProgressTracker;
use crate::storage::StorageClient;

use super::worker::run_transfer;

enum QueueSignal {
    Continue,
    RunOnce { respond: oneshot::Sender<usize> },
}

pub(super) struct QueueInner {
    pub(super) store: Arc<dyn Store>,
    pub(super) storage: Arc<dyn StorageClient>,
    pub(super) config: EngineConfig,
    pub(super) events: Arc<EventBus>,
    pub(super) tracker: ProgressTracker,
    // Cancel flags of items that have a worker, or are about to get one
    cancel_registry: Mutex<HashMap<String, Arc<AtomicBool>>>,
    // Ids whose worker task has not exited yet, cancelled ones included
    workers: Mutex<HashSet<String>>,
    senders: Mutex<HashMap<TransferDirection, mpsc::Sender<QueueSignal>>>,
}

/// Persistent upload/download queue.
///
/// Cloning is cheap; clones share the same pools and registries.
#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<QueueInner>,
}

fn validate_request(request: &EnqueueRequest) -> EngineResult<()> {
    if request.target_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("Target id is required".to_string()));
    }
    if request.bucket.trim().is_empty() {
        return Err(EngineError::InvalidInput("Bucket is required".to_string()));
    }
    if request.key.is_empty() {
        return Err(EngineError::InvalidInput("Object key is required".to_string()));
    }
    let missing = |path: &Option<String>| path.as_deref().map_or(true, |p| p.trim().is_empty());
    match request.direction {
        TransferDirection::Upload if missing(&request.source_path) => Err(
            EngineError::InvalidTransferSpec("Upload requires a source path".to_string()),
        ),
        TransferDirection::Download if missing(&request.destination_path) => Err(
            EngineError::InvalidTransferSpec("Download requires a destination path".to_string()),
        ),
        _ => Ok(()),
    }
}

impl QueueInner {
    fn slots(&self, direction: TransferDirection) -> usize {
        match direction {
            TransferDirection::Upload => self.config.concurrent_uploads,
            TransferDirection::Download => self.config.concurrent_downloads,
        }
    }

    /// Reuses a flag set by a cancel that raced the start of the worker.
    fn cancel_flag(&self, id: &str) -> Arc<AtomicBool> {
        let mut registry = self.cancel_registry.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    fn drop_cancel_flag(&self, id: &str) {
        let mut registry = self.cancel_registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.remove(id);
    }

    /// Removes the entry only if it still belongs to the worker holding `flag`.
    pub(super) fn release_cancel_flag(&self, id: &str, flag: &Arc<AtomicBool>) {
        let mut registry = self.cancel_registry.lock().unwrap_or_else(|e| e.into_inner());
        if registry.get(id).is_some_and(|current| Arc::ptr_eq(current, flag)) {
            registry.remove(id);
        }
    }

    /// Claims the worker slot of `id`; false while a previous worker of the
    /// same item is still draining.
    fn claim_worker(&self, id: &str) -> bool {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.insert(id.to_string())
    }

    pub(super) fn release_worker(&self, id: &str) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.remove(id);
    }

    fn worker_count(&self) -> usize {
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(super) fn publish_status(&self, id: &str, status: TransferStatus, error: Option<String>) {
        match error.as_ref() {
            Some(err) => warn!("transfer_status: {} -> {} error={}", id, status, err),
            None => info!("transfer_status: {} -> {}", id, status),
        }
        self.events.transfer_status(id, status, error);
    }

    fn pump_sender(self: &Arc<Self>, direction: TransferDirection) -> mpsc::Sender<QueueSignal> {
        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = senders.get(&direction) {
            return sender.clone();
        }
        let (sender, receiver) = mpsc::channel(8);
        tokio::spawn(run_pump(Arc::downgrade(self), direction, receiver));
        senders.insert(direction, sender.clone());
        sender
    }

    /// Wake the pump of `direction`. Wakeups coalesce while one is pending.
    pub(super) fn schedule(self: &Arc<Self>, direction: TransferDirection) {
        let sender = self.pump_sender(direction);
        if sender.try_send(QueueSignal::Continue).is_err() {
            debug!("transfer_schedule: skip pending {}", direction);
        }
    }

    /// Run the pump once and return how many items it started.
    async fn request_run(self: &Arc<Self>, direction: TransferDirection) -> usize {
        let sender = self.pump_sender(direction);
        let (respond, receiver) = oneshot::channel();
        if sender.send(QueueSignal::RunOnce { respond }).await.is_err() {
            return 0;
        }
        receiver.await.unwrap_or(0)
    }
}

async fn run_pump(
    inner: Weak<QueueInner>,
    direction: TransferDirection,
    mut receiver: mpsc::Receiver<QueueSignal>,
) {
    while let Some(signal) = receiver.recv().await {
        let mut responders = Vec::new();
        if let QueueSignal::RunOnce { respond } = signal {
            responders.push(respond);
        }
        while let Ok(next_signal) = receiver.try_recv() {
            if let QueueSignal::RunOnce { respond } = next_signal {
                responders.push(respond);
            }
        }
        let Some(queue) = inner.upgrade() else {
            break;
        };
        let started = continue_queue(&queue, direction).await;
        drop(queue);
        for respond in responders {
            let _ = respond.send(started);
        }
    }
    debug!("transfer_pump_stopped: {}", direction);
}

/// Move as many queued items into `active` as the direction has free slots.
async fn continue_queue(inner: &Arc<QueueInner>, direction: TransferDirection) -> usize {
    let active = match inner.store.count_active_transfers(direction).await {
        Ok(count) => count as usize,
        Err(e) => {
            error!("continue_queue: count failed for {} error={}", direction, e);
            return 0;
        }
    };
    let slots_available = inner.slots(direction).saturating_sub(active);
    debug!(
        "queue_check: {} active={} slots={}",
        direction, active, slots_available
    );
    if slots_available == 0 {
        return 0;
    }

    // Draining workers may hold some of the oldest queued ids; look past them.
    let next_items = match inner
        .store
        .next_queued_transfers(direction, slots_available + inner.worker_count())
        .await
    {
        Ok(items) => items,
        Err(e) => {
            error!("continue_queue: lookup failed for {} error={}", direction, e);
            return 0;
        }
    };

    let mut started = 0;
    for item in next_items {
        if started == slots_available {
            break;
        }
        if !inner.claim_worker(&item.id) {
            // Its cancelled worker wakes the pump again on exit.
            debug!("queue_skip_draining: {}", item.id);
            continue;
        }
        let cancel = inner.cancel_flag(&item.id);
        match inner
            .store
            .transition_transfer(&item.id, &[TransferStatus::Queued], TransferStatus::Active, None)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Cancelled or removed since the lookup.
                inner.release_cancel_flag(&item.id, &cancel);
                inner.release_worker(&item.id);
                continue;
            }
            Err(e) => {
                error!("queue_start_failed_status_update: {} error={}", item.id, e);
                inner.release_cancel_flag(&item.id, &cancel);
                inner.release_worker(&item.id);
                continue;
            }
        }
        inner.publish_status(&item.id, TransferStatus::Active, None);

        let mut item = item;
        item.status = TransferStatus::Active;
        tokio::spawn(run_transfer(inner.clone(), item, cancel));
        started += 1;
    }
    if started > 0 {
        info!("queue_started: {} count={}", direction, started);
    }
    started
}

impl TransferQueue {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn StorageClient>,
        config: EngineConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                storage,
                config,
                events,
                tracker: ProgressTracker::new(),
                cancel_registry: Mutex::new(HashMap::new()),
                workers: Mutex::new(HashSet::new()),
                senders: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Persist a new `queued` item and wake its direction's pump.
    pub async fn enqueue(&self, request: EnqueueRequest) -> EngineResult<TransferQueueItem> {
        validate_request(&request)?;
        let id = match request.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => new_id(),
        };
        if self.inner.store.get_transfer(&id).await?.is_some() {
            return Err(EngineError::InvalidInput(format!(
                "Transfer {} already exists",
                id
            )));
        }

        let now = now_millis();
        let item = TransferQueueItem {
            id,
            direction: request.direction,
            target_id: request.target_id,
            bucket: request.bucket,
            key: request.key,
            source_path: request.source_path,
            destination_path: request.destination_path,
            total_bytes: request.size,
            transferred_bytes: 0,
            status: TransferStatus::Queued,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.inner.store.insert_transfer(&item).await?;
        info!(
            "transfer_enqueued: {} {} {}/{}",
            item.id, item.direction, item.bucket, item.key
        );
        self.inner.publish_status(&item.id, TransferStatus::Queued, None);
        self.inner.schedule(item.direction);
        Ok(item)
    }

    pub async fn get(&self, id: &str) -> EngineResult<TransferQueueItem> {
        self.inner
            .store
            .get_transfer(id)
            .await?
            .ok_or_else(|| EngineError::not_found("transfer", id))
    }

    pub async fn list(&self) -> EngineResult<Vec<TransferQueueItem>> {
        Ok(self.inner.store.list_transfers().await?)
    }

    /// Stop a queued or active item. Already-terminal items are returned
    /// unchanged.
    pub async fn cancel(&self, id: &str) -> EngineResult<TransferQueueItem> {
        let item = self.get(id).await?;
        if item.status.is_terminal() {
            debug!("transfer_cancel: {} already {}", id, item.status);
            return Ok(item);
        }

        let flag = self.inner.cancel_flag(id);
        flag.store(true, Ordering::SeqCst);

        let store = &self.inner.store;
        if store
            .transition_transfer(id, &[TransferStatus::Queued], TransferStatus::Cancelled, None)
            .await?
        {
            // No worker owns a queued item, so nobody else will clear the flag.
            self.inner.drop_cancel_flag(id);
            self.inner.publish_status(id, TransferStatus::Cancelled, None);
        } else if store
            .transition_transfer(id, &[TransferStatus::Active], TransferStatus::Cancelled, None)
            .await?
        {
            // The worker stops at its next part boundary; the slot is free now.
            self.inner.publish_status(id, TransferStatus::Cancelled, None);
            self.inner.schedule(item.direction);
        } else {
            debug!("transfer_cancel: {} finished before cancel", id);
        }
        self.get(id).await
    }

    /// Re-queue a failed or cancelled item with its progress reset. A
    /// cancelled item whose worker is still stopping stays `queued` until
    /// that worker has exited.
    pub async fn retry(&self, id: &str) -> EngineResult<TransferQueueItem> {
        let item = self.get(id).await?;
        if !matches!(
            item.status,
            TransferStatus::Failed | TransferStatus::Cancelled
        ) {
            return Err(EngineError::invalid_transition(
                "transfer",
                "retry",
                item.status,
            ));
        }

        // A fresh worker must not inherit the old cancel request.
        self.inner.drop_cancel_flag(id);
        let requeued = self
            .inner
            .store
            .requeue_transfer(id, &[TransferStatus::Failed, TransferStatus::Cancelled])
            .await?;
        if !requeued {
            let current = self.get(id).await?;
            return Err(EngineError::invalid_transition(
                "transfer",
                "retry",
                current.status,
            ));
        }
        self.inner.tracker.forget(id);
        info!("transfer_retry_requested: {} from={}", id, item.status);
        self.inner.publish_status(id, TransferStatus::Queued, None);
        self.inner.schedule(item.direction);
        self.get(id).await
    }

    /// Delete an item. Queued and active items are cancelled first so no
    /// worker keeps running without a record.
    pub async fn remove(&self, id: &str) -> EngineResult<()> {
        let item = self.get(id).await?;
        if !item.status.is_terminal() {
            self.cancel(id).await?;
        }
        self.inner.store.delete_transfer(id).await?;
        discard_session(self.inner.storage.as_ref(), self.inner.store.as_ref(), id).await;
        self.inner.tracker.forget(id);
        info!("transfer_removed: {}", id);
        self.inner
            .events
            .publish(EngineEvent::TransferRemoved(TransferRemoved { id: id.to_string() }));
        Ok(())
    }

    /// Remove every completed, failed and cancelled item.
    pub async fn clear_terminal(&self) -> EngineResult<u64> {
        let terminal: Vec<String> = self
            .inner
            .store
            .list_transfers()
            .await?
            .into_iter()
            .filter(|item| item.status.is_terminal())
            .map(|item| item.id)
            .collect();
        let removed = self.inner.store.delete_terminal_transfers().await?;
        for id in terminal {
            self.inner.tracker.forget(&id);
            self.inner
                .events
                .publish(EngineEvent::TransferRemoved(TransferRemoved { id }));
        }
        info!("transfer_clear_terminal: removed={}", removed);
        Ok(removed)
    }

    /// Create-or-update from a client-side record. Unknown ids are enqueued.
    /// For known ids only the requested intent is applied: `cancelled`
    /// cancels, `queued` on a failed or cancelled item retries. Progress
    /// fields always stay under engine control.
    pub async fn upsert(&self, item: TransferQueueItem) -> EngineResult<TransferQueueItem> {
        let Some(existing) = self.inner.store.get_transfer(&item.id).await? else {
            return self.enqueue(EnqueueRequest::from(&item)).await;
        };
        match (item.status, existing.status) {
            (TransferStatus::Cancelled, current) if !current.is_terminal() => {
                self.cancel(&item.id).await
            }
            (TransferStatus::Queued, TransferStatus::Failed | TransferStatus::Cancelled) => {
                self.retry(&item.id).await
            }
            _ => Ok(existing),
        }
    }

    /// Start-up recovery: interrupted items go back to `queued` and both
    /// pools are pumped. Returns how many items were reset.
    pub(crate) async fn recover(&self) -> EngineResult<u64> {
        let reset = self.inner.store.reset_interrupted_transfers().await?;
        if reset > 0 {
            warn!("transfer_recover: requeued {} interrupted items", reset);
        }
        for direction in [TransferDirection::Upload, TransferDirection::Download] {
            let started = self.inner.request_run(direction).await;
            info!("transfer_recover: {} started={}", direction, started);
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, TransferRepository};
    use crate::storage::StorageError;
    use crate::testing::{wait_for, FakeStorage};

    struct Fixture {
        queue: TransferQueue,
        storage: Arc<FakeStorage>,
        store: Arc<MemoryStore>,
        events: Arc<EventBus>,
        dir: tempfile::TempDir,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let storage = Arc::new(FakeStorage::new());
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(256, 256));
        let queue = TransferQueue::new(store.clone(), storage.clone(), config, events.clone());
        Fixture {
            queue,
            storage,
            store,
            events,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry_backoff_ms: 1,
            progress_interval_ms: 0,
            ..EngineConfig::default()
        }
    }

    impl Fixture {
        fn local_file(&self, name: &str, len: usize) -> String {
            let path = self.dir.path().join(name);
            let body: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            std::fs::write(&path, body).unwrap();
            path.to_string_lossy().into_owned()
        }

        async fn upload(&self, key: &str, len: usize) -> TransferQueueItem {
            let path = self.local_file(key, len);
            self.queue
                .enqueue(EnqueueRequest::upload("t1", "bucket", key, path))
                .await
                .unwrap()
        }

        async fn wait_status(&self, id: &str, status: TransferStatus) -> TransferQueueItem {
            wait_for(&format!("{} to become {}", id, status), || {
                let queue = self.queue.clone();
                let id = id.to_string();
                async move {
                    queue
                        .get(&id)
                        .await
                        .map(|item| item.status == status)
                        .unwrap_or(false)
                }
            })
            .await;
            self.queue.get(id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn enqueue_rejects_missing_paths() {
        let f = fixture(fast_config());
        let mut request = EnqueueRequest::upload("t1", "bucket", "a.txt", "");
        request.source_path = None;
        let err = f.queue.enqueue(request).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransferSpec(_)));

        let mut request = EnqueueRequest::download("t1", "bucket", "a.txt", "x");
        request.destination_path = Some("  ".to_string());
        let err = f.queue.enqueue(request).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransferSpec(_)));

        assert!(f.queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_runs_to_completion() {
        let f = fixture(fast_config());
        let item = f.upload("report.csv", 30).await;
        assert_eq!(item.status, TransferStatus::Queued);

        let done = f.wait_status(&item.id, TransferStatus::Completed).await;
        assert_eq!(done.total_bytes, Some(30));
        assert_eq!(done.transferred_bytes, 30);
        assert!(done.completed_at.is_some());
        assert_eq!(f.storage.object("t1", "bucket", "report.csv").unwrap().len(), 30);
    }

    #[tokio::test]
    async fn download_lands_at_destination() {
        let f = fixture(EngineConfig {
            verify_checksum: true,
            ..fast_config()
        });
        f.storage
            .insert_object("t1", "bucket", "photos/cat.jpg", vec![9u8; 64], 1_000);
        let dest = f.dir.path().join("out").join("cat.jpg");

        let item = f
            .queue
            .enqueue(EnqueueRequest::download(
                "t1",
                "bucket",
                "photos/cat.jpg",
                dest.to_string_lossy(),
            ))
            .await
            .unwrap();

        let done = f.wait_status(&item.id, TransferStatus::Completed).await;
        assert_eq!(done.total_bytes, Some(64));
        assert_eq!(done.transferred_bytes, 64);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![9u8; 64]);
    }

    #[tokio::test]
    async fn declared_sizes_give_way_to_the_real_source() {
        let f = fixture(EngineConfig {
            multipart_threshold: 10,
            part_size: 4,
            ..fast_config()
        });
        let path = f.local_file("grown.bin", 30);
        let mut upload = EnqueueRequest::upload("t1", "bucket", "grown.bin", path);
        upload.size = Some(12);
        let upload = f.queue.enqueue(upload).await.unwrap();

        f.storage
            .insert_object("t1", "bucket", "big.bin", vec![3u8; 100], 1_000);
        let dest = f.dir.path().join("big.bin");
        let mut download =
            EnqueueRequest::download("t1", "bucket", "big.bin", dest.to_string_lossy());
        download.size = Some(40);
        let download = f.queue.enqueue(download).await.unwrap();

        let done = f.wait_status(&upload.id, TransferStatus::Completed).await;
        assert_eq!(done.total_bytes, Some(30));
        assert_eq!(done.transferred_bytes, 30);
        assert_eq!(f.storage.object("t1", "bucket", "grown.bin").unwrap().len(), 30);

        let done = f.wait_status(&download.id, TransferStatus::Completed).await;
        assert_eq!(done.total_bytes, Some(100));
        assert_eq!(done.transferred_bytes, 100);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![3u8; 100]);
    }

    #[tokio::test]
    async fn retry_waits_for_the_cancelled_worker_to_stop() {
        let f = fixture(fast_config());
        f.storage.hold_writes();
        let item = f.upload("redo", 6).await;
        f.wait_status(&item.id, TransferStatus::Active).await;

        f.queue.cancel(&item.id).await.unwrap();
        let requeued = f.queue.retry(&item.id).await.unwrap();
        assert_eq!(requeued.status, TransferStatus::Queued);

        // The cancelled worker is still inside its held write.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(f.queue.get(&item.id).await.unwrap().status, TransferStatus::Queued);
        assert_eq!(f.storage.count_calls("put_object"), 0);

        // Its write finishes, it exits, and only then the retry starts.
        f.storage.release_writes(1);
        f.wait_status(&item.id, TransferStatus::Active).await;
        assert_eq!(f.storage.count_calls("put_object"), 1);

        f.storage.open_writes();
        let done = f.wait_status(&item.id, TransferStatus::Completed).await;
        assert_eq!(done.transferred_bytes, 6);
        assert_eq!(f.storage.count_calls("put_object"), 2);
    }

    #[tokio::test]
    async fn upload_slots_bound_active_items() {
        let f = fixture(EngineConfig {
            concurrent_uploads: 1,
            ..fast_config()
        });
        f.storage.hold_writes();
        let a = f.upload("a", 5).await;
        let b = f.upload("b", 5).await;
        let c = f.upload("c", 5).await;

        f.wait_status(&a.id, TransferStatus::Active).await;
        assert_eq!(
            f.store
                .count_active_transfers(TransferDirection::Upload)
                .await
                .unwrap(),
            1
        );
        assert_eq!(f.queue.get(&b.id).await.unwrap().status, TransferStatus::Queued);
        assert_eq!(f.queue.get(&c.id).await.unwrap().status, TransferStatus::Queued);

        f.storage.open_writes();
        for item in [&a, &b, &c] {
            f.wait_status(&item.id, TransferStatus::Completed).await;
        }
    }

    #[tokio::test]
    async fn cancelling_a_queued_item_never_activates_it() {
        let f = fixture(EngineConfig {
            concurrent_uploads: 1,
            ..fast_config()
        });
        f.storage.hold_writes();
        let mut sub = f.events.subscribe();
        let a = f.upload("a", 5).await;
        let b = f.upload("b", 5).await;
        f.wait_status(&a.id, TransferStatus::Active).await;

        let cancelled = f.queue.cancel(&b.id).await.unwrap();
        assert_eq!(cancelled.status, TransferStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        f.storage.open_writes();
        f.wait_status(&a.id, TransferStatus::Completed).await;
        assert!(f.storage.object("t1", "bucket", "b").is_none());

        // Cancelling again is a no-op.
        let again = f.queue.cancel(&b.id).await.unwrap();
        assert_eq!(again.status, TransferStatus::Cancelled);

        let mut b_states = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
        {
            if let EngineEvent::TransferStatusChanged(e) = event {
                if e.id == b.id {
                    b_states.push(e.status);
                }
            }
        }
        assert_eq!(
            b_states,
            vec![TransferStatus::Queued, TransferStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn transient_failures_exhaust_retries_then_manual_retry_succeeds() {
        let f = fixture(EngineConfig {
            retry_count: 2,
            ..fast_config()
        });
        f.storage.fail(
            "put_object",
            Some("flaky"),
            StorageError::Transient("connection reset".into()),
            Some(3),
        );
        let item = f.upload("flaky", 12).await;

        let failed = f.wait_status(&item.id, TransferStatus::Failed).await;
        assert_eq!(failed.retry_count, 2);
        assert!(failed
            .error_message
            .as_deref()
            .unwrap()
            .contains("connection reset"));
        assert_eq!(f.storage.count_calls("put_object"), 3);

        let requeued = f.queue.retry(&item.id).await.unwrap();
        assert_eq!(requeued.transferred_bytes, 0);
        assert_eq!(requeued.retry_count, 0);

        let done = f.wait_status(&item.id, TransferStatus::Completed).await;
        assert_eq!(done.transferred_bytes, 12);
        assert_eq!(done.total_bytes, Some(12));
    }

    #[tokio::test]
    async fn permission_errors_are_not_retried() {
        let f = fixture(fast_config());
        f.storage.fail(
            "put_object",
            None,
            StorageError::AccessDenied("403".into()),
            None,
        );
        let item = f.upload("secret", 4).await;

        let failed = f.wait_status(&item.id, TransferStatus::Failed).await;
        assert_eq!(failed.retry_count, 0);
        assert_eq!(f.storage.count_calls("put_object"), 1);
    }

    #[tokio::test]
    async fn auto_retry_disabled_fails_at_once() {
        let f = fixture(EngineConfig {
            auto_retry: false,
            ..fast_config()
        });
        f.storage.fail(
            "put_object",
            None,
            StorageError::Transient("timeout".into()),
            Some(1),
        );
        let item = f.upload("once", 4).await;
        let failed = f.wait_status(&item.id, TransferStatus::Failed).await;
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_reported() {
        let f = fixture(EngineConfig {
            verify_checksum: true,
            ..fast_config()
        });
        f.storage.corrupt_etags(true);
        let item = f.upload("corrupt", 8).await;
        let failed = f.wait_status(&item.id, TransferStatus::Failed).await;
        assert!(failed
            .error_message
            .as_deref()
            .unwrap()
            .contains("Checksum mismatch"));
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn retry_is_only_valid_from_failed_or_cancelled() {
        let f = fixture(fast_config());
        let item = f.upload("ok", 4).await;
        f.wait_status(&item.id, TransferStatus::Completed).await;
        let err = f.queue.retry(&item.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

        let err = f.queue.cancel("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn progress_never_reaches_total_before_completion() {
        let f = fixture(EngineConfig {
            multipart_threshold: 10,
            part_size: 4,
            max_concurrent_parts: 1,
            ..fast_config()
        });
        let mut sub = f.events.subscribe();
        let item = f.upload("big", 30).await;
        f.wait_status(&item.id, TransferStatus::Completed).await;

        let mut saw_progress = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
        {
            if let EngineEvent::TransferProgress(p) = event {
                assert_eq!(p.total_bytes, Some(30));
                if p.status == TransferStatus::Active {
                    saw_progress = true;
                    assert!(p.transferred_bytes < 30);
                } else {
                    assert_eq!(p.status, TransferStatus::Completed);
                    assert_eq!(p.transferred_bytes, 30);
                }
            }
        }
        assert!(saw_progress);
    }

    #[tokio::test]
    async fn remove_cancels_active_item_and_announces_it() {
        let f = fixture(fast_config());
        f.storage.hold_writes();
        let item = f.upload("held", 4).await;
        f.wait_status(&item.id, TransferStatus::Active).await;
        let mut sub = f.events.subscribe();

        f.queue.remove(&item.id).await.unwrap();
        assert!(f.store.get_transfer(&item.id).await.unwrap().is_none());

        let mut topics = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
        {
            topics.push(event.topic());
        }
        assert_eq!(
            topics,
            vec![crate::events::TRANSFER_STATUS_CHANGE, crate::events::TRANSFER_REMOVED]
        );
        f.storage.open_writes();
    }

    #[tokio::test]
    async fn clear_terminal_keeps_live_items() {
        let f = fixture(EngineConfig {
            concurrent_uploads: 1,
            ..fast_config()
        });
        let done = f.upload("done", 4).await;
        f.wait_status(&done.id, TransferStatus::Completed).await;

        f.storage.hold_writes();
        let live = f.upload("live", 4).await;
        let waiting = f.upload("waiting", 4).await;
        f.wait_status(&live.id, TransferStatus::Active).await;

        assert_eq!(f.queue.clear_terminal().await.unwrap(), 1);
        let mut ids: Vec<String> = f.queue.list().await.unwrap().into_iter().map(|i| i.id).collect();
        ids.sort();
        let mut expected = vec![live.id.clone(), waiting.id.clone()];
        expected.sort();
        assert_eq!(ids, expected);
        f.storage.open_writes();
    }

    #[tokio::test]
    async fn upsert_applies_intent_only() {
        let f = fixture(fast_config());
        f.storage.hold_writes();
        let path = f.local_file("u", 4);

        let mut record = TransferQueueItem {
            id: "client-1".to_string(),
            direction: TransferDirection::Upload,
            target_id: "t1".to_string(),
            bucket: "bucket".to_string(),
            key: "u".to_string(),
            source_path: Some(path),
            destination_path: None,
            total_bytes: None,
            transferred_bytes: 999,
            status: TransferStatus::Completed,
            retry_count: 5,
            error_message: None,
            created_at: 0,
            updated_at: 0,
            completed_at: None,
        };
        let created = f.queue.upsert(record.clone()).await.unwrap();
        assert_eq!(created.id, "client-1");
        assert_eq!(created.status, TransferStatus::Queued);
        assert_eq!(created.transferred_bytes, 0);

        f.wait_status("client-1", TransferStatus::Active).await;
        record.status = TransferStatus::Cancelled;
        let cancelled = f.queue.upsert(record.clone()).await.unwrap();
        assert_eq!(cancelled.status, TransferStatus::Cancelled);

        // A progress-only update is ignored.
        record.transferred_bytes = 3;
        record.status = TransferStatus::Active;
        let unchanged = f.queue.upsert(record.clone()).await.unwrap();
        assert_eq!(unchanged.status, TransferStatus::Cancelled);

        f.storage.open_writes();
        record.status = TransferStatus::Queued;
        let retried = f.queue.upsert(record).await.unwrap();
        assert_eq!(retried.status, TransferStatus::Queued);
        f.wait_status("client-1", TransferStatus::Completed).await;
    }

    #[tokio::test]
    async fn recover_restarts_interrupted_items() {
        let f = fixture(fast_config());
        let path = f.local_file("interrupted", 6);
        let now = now_millis();
        f.store
            .insert_transfer(&TransferQueueItem {
                id: "stale".to_string(),
                direction: TransferDirection::Upload,
                target_id: "t1".to_string(),
                bucket: "bucket".to_string(),
                key: "interrupted".to_string(),
                source_path: Some(path),
                destination_path: None,
                total_bytes: Some(6),
                transferred_bytes: 3,
                status: TransferStatus::Active,
                retry_count: 0,
                error_message: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            })
            .await
            .unwrap();

        assert_eq!(f.queue.recover().await.unwrap(), 1);
        let done = f.wait_status("stale", TransferStatus::Completed).await;
        assert_eq!(done.transferred_bytes, 6);
    }
}
