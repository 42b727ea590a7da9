use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{
    CloneRepository, DbResult, MultipartRepository, MultipartSession, StoredPart,
    TransferRepository,
};
use crate::model::{
    now_millis, CloneItemStatus, CloneJob, CloneJobItem, CloneJobStatus, ItemOutcome,
    TransferDirection, TransferQueueItem, TransferStatus,
};

#[derive(Default)]
struct MemoryState {
    transfers: Vec<TransferQueueItem>,
    jobs: Vec<CloneJob>,
    items: Vec<CloneJobItem>,
    sessions: HashMap<String, MultipartSession>,
}

/// In-process store with the same semantics as the turso one. Nothing
/// survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A panic mid-update cannot leave a half-written row; keep serving.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemoryState {
    fn transfer_mut(&mut self, id: &str) -> Option<&mut TransferQueueItem> {
        self.transfers.iter_mut().find(|t| t.id == id)
    }

    fn job_mut(&mut self, id: &str) -> Option<&mut CloneJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    fn item_mut(&mut self, id: &str) -> Option<&mut CloneJobItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }
}

fn sorted_by_creation(mut items: Vec<TransferQueueItem>) -> Vec<TransferQueueItem> {
    items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    items
}

#[async_trait]
impl TransferRepository for MemoryStore {
    async fn insert_transfer(&self, item: &TransferQueueItem) -> DbResult<()> {
        let mut state = self.state();
        if state.transfers.iter().any(|t| t.id == item.id) {
            return Err(format!("Transfer {} already exists", item.id).into());
        }
        state.transfers.push(item.clone());
        Ok(())
    }

    async fn get_transfer(&self, id: &str) -> DbResult<Option<TransferQueueItem>> {
        Ok(self.state().transfers.iter().find(|t| t.id == id).cloned())
    }

    async fn list_transfers(&self) -> DbResult<Vec<TransferQueueItem>> {
        Ok(sorted_by_creation(self.state().transfers.clone()))
    }

    async fn delete_transfer(&self, id: &str) -> DbResult<bool> {
        let mut state = self.state();
        let before = state.transfers.len();
        state.transfers.retain(|t| t.id != id);
        Ok(state.transfers.len() != before)
    }

    async fn delete_terminal_transfers(&self) -> DbResult<u64> {
        let mut state = self.state();
        let before = state.transfers.len();
        state.transfers.retain(|t| !t.status.is_terminal());
        Ok((before - state.transfers.len()) as u64)
    }

    async fn count_active_transfers(&self, direction: TransferDirection) -> DbResult<u64> {
        Ok(self
            .state()
            .transfers
            .iter()
            .filter(|t| t.direction == direction && t.status == TransferStatus::Active)
            .count() as u64)
    }

    async fn next_queued_transfers(
        &self,
        direction: TransferDirection,
        limit: usize,
    ) -> DbResult<Vec<TransferQueueItem>> {
        let queued = self
            .state()
            .transfers
            .iter()
            .filter(|t| t.direction == direction && t.status == TransferStatus::Queued)
            .cloned()
            .collect();
        Ok(sorted_by_creation(queued).into_iter().take(limit).collect())
    }

    async fn transition_transfer(
        &self,
        id: &str,
        from: &[TransferStatus],
        to: TransferStatus,
        error: Option<&str>,
    ) -> DbResult<bool> {
        let mut state = self.state();
        let Some(item) = state.transfer_mut(id) else {
            return Ok(false);
        };
        if !from.contains(&item.status) {
            return Ok(false);
        }
        let now = now_millis();
        item.status = to;
        if let Some(error) = error {
            item.error_message = Some(error.to_string());
        }
        item.completed_at = to.is_terminal().then_some(now);
        item.updated_at = now;
        Ok(true)
    }

    async fn set_transfer_total(&self, id: &str, total_bytes: u64) -> DbResult<()> {
        let mut state = self.state();
        if let Some(item) = state.transfer_mut(id) {
            item.total_bytes = Some(total_bytes);
            item.updated_at = now_millis();
        }
        Ok(())
    }

    async fn update_transfer_progress(&self, id: &str, transferred_bytes: u64) -> DbResult<()> {
        let mut state = self.state();
        if let Some(item) = state.transfer_mut(id) {
            if item.status == TransferStatus::Active && item.transferred_bytes < transferred_bytes
            {
                item.transferred_bytes = transferred_bytes;
                item.updated_at = now_millis();
            }
        }
        Ok(())
    }

    async fn complete_transfer(&self, id: &str) -> DbResult<bool> {
        let mut state = self.state();
        let Some(item) = state.transfer_mut(id) else {
            return Ok(false);
        };
        if item.status != TransferStatus::Active {
            return Ok(false);
        }
        let now = now_millis();
        let total = item.total_bytes.unwrap_or(item.transferred_bytes);
        item.total_bytes = Some(total);
        item.transferred_bytes = total;
        item.status = TransferStatus::Completed;
        item.error_message = None;
        item.completed_at = Some(now);
        item.updated_at = now;
        Ok(true)
    }

    async fn requeue_transfer(&self, id: &str, from: &[TransferStatus]) -> DbResult<bool> {
        let mut state = self.state();
        let Some(item) = state.transfer_mut(id) else {
            return Ok(false);
        };
        if !from.contains(&item.status) {
            return Ok(false);
        }
        let now = now_millis();
        item.status = TransferStatus::Queued;
        item.transferred_bytes = 0;
        item.retry_count = 0;
        item.error_message = None;
        item.completed_at = None;
        item.created_at = now;
        item.updated_at = now;
        Ok(true)
    }

    async fn record_transfer_retry(&self, id: &str, error: &str) -> DbResult<u32> {
        let mut state = self.state();
        let Some(item) = state.transfer_mut(id) else {
            return Ok(0);
        };
        if item.status == TransferStatus::Active {
            item.retry_count += 1;
            item.error_message = Some(error.to_string());
            item.updated_at = now_millis();
        }
        Ok(item.retry_count)
    }

    async fn reset_interrupted_transfers(&self) -> DbResult<u64> {
        let mut state = self.state();
        let now = now_millis();
        let mut reset = 0;
        for item in state
            .transfers
            .iter_mut()
            .filter(|t| t.status == TransferStatus::Active)
        {
            item.status = TransferStatus::Queued;
            item.transferred_bytes = 0;
            item.updated_at = now;
            reset += 1;
        }
        Ok(reset)
    }
}

#[async_trait]
impl CloneRepository for MemoryStore {
    async fn insert_clone_job(&self, job: &CloneJob) -> DbResult<()> {
        let mut state = self.state();
        if state.jobs.iter().any(|j| j.id == job.id) {
            return Err(format!("Clone job {} already exists", job.id).into());
        }
        state.jobs.push(job.clone());
        Ok(())
    }

    async fn get_clone_job(&self, id: &str) -> DbResult<Option<CloneJob>> {
        Ok(self.state().jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_clone_jobs(&self) -> DbResult<Vec<CloneJob>> {
        let mut jobs = self.state().jobs.clone();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn transition_clone_job(
        &self,
        id: &str,
        from: &[CloneJobStatus],
        to: CloneJobStatus,
        error: Option<&str>,
    ) -> DbResult<bool> {
        let mut state = self.state();
        let Some(job) = state.job_mut(id) else {
            return Ok(false);
        };
        if !from.contains(&job.status) {
            return Ok(false);
        }
        let now = now_millis();
        job.status = to;
        if let Some(error) = error {
            job.error_message = Some(error.to_string());
        } else if !to.is_terminal() {
            job.error_message = None;
        }
        job.completed_at = to.is_terminal().then_some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn record_enumeration_page(
        &self,
        job_id: &str,
        items: &[CloneJobItem],
        next_token: Option<&str>,
        complete: bool,
    ) -> DbResult<u64> {
        let mut state = self.state();
        if !state.jobs.iter().any(|j| j.id == job_id) {
            return Err(format!("Clone job {} does not exist", job_id).into());
        }
        let mut inserted = 0u64;
        let mut inserted_bytes = 0u64;
        for item in items {
            let known = state
                .items
                .iter()
                .any(|i| i.job_id == job_id && i.source_key == item.source_key);
            if known {
                continue;
            }
            let mut item = item.clone();
            item.job_id = job_id.to_string();
            inserted_bytes += item.size;
            state.items.push(item);
            inserted += 1;
        }
        if let Some(job) = state.job_mut(job_id) {
            job.total_items += inserted;
            job.total_bytes += inserted_bytes;
            job.enumeration_token = next_token.map(|t| t.to_string());
            job.enumeration_complete = complete;
            job.updated_at = now_millis();
        }
        Ok(inserted)
    }

    async fn next_pending_clone_items(
        &self,
        job_id: &str,
        limit: usize,
    ) -> DbResult<Vec<CloneJobItem>> {
        let mut pending: Vec<CloneJobItem> = self
            .state()
            .items
            .iter()
            .filter(|i| i.job_id == job_id && i.status == CloneItemStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.source_key.cmp(&b.source_key))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claim_clone_item(&self, item_id: &str) -> DbResult<bool> {
        let mut state = self.state();
        match state.item_mut(item_id) {
            Some(item) if item.status == CloneItemStatus::Pending => {
                item.status = CloneItemStatus::Active;
                item.updated_at = now_millis();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_clone_item(&self, item_id: &str, outcome: &ItemOutcome) -> DbResult<bool> {
        let mut state = self.state();
        let now = now_millis();
        let Some(item) = state.item_mut(item_id) else {
            return Ok(false);
        };
        if item.status != CloneItemStatus::Active {
            return Ok(false);
        }
        let job_id = item.job_id.clone();
        let size = item.size;
        item.updated_at = now;
        match outcome {
            ItemOutcome::Completed => {
                item.status = CloneItemStatus::Completed;
                item.error_message = None;
            }
            ItemOutcome::Skipped => {
                item.status = CloneItemStatus::Skipped;
                item.error_message = None;
            }
            ItemOutcome::Failed(message) => {
                item.status = CloneItemStatus::Failed;
                item.error_message = Some(message.clone());
                item.retry_count += 1;
            }
            ItemOutcome::Retry(message) => {
                item.status = CloneItemStatus::Pending;
                item.error_message = Some(message.clone());
                item.retry_count += 1;
            }
            ItemOutcome::Released => {
                item.status = CloneItemStatus::Pending;
            }
        }
        if let Some(job) = state.job_mut(&job_id) {
            match outcome {
                ItemOutcome::Completed => {
                    job.completed_items += 1;
                    job.transferred_bytes += size;
                }
                ItemOutcome::Skipped => job.skipped_items += 1,
                ItemOutcome::Failed(_) => job.failed_items += 1,
                ItemOutcome::Retry(_) | ItemOutcome::Released => {}
            }
            job.updated_at = now;
        }
        Ok(true)
    }

    async fn get_clone_item(&self, item_id: &str) -> DbResult<Option<CloneJobItem>> {
        Ok(self.state().items.iter().find(|i| i.id == item_id).cloned())
    }

    async fn list_clone_items(&self, job_id: &str) -> DbResult<Vec<CloneJobItem>> {
        let mut items: Vec<CloneJobItem> = self
            .state()
            .items
            .iter()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.source_key.cmp(&b.source_key))
        });
        Ok(items)
    }

    async fn count_clone_items(&self, job_id: &str, status: CloneItemStatus) -> DbResult<u64> {
        Ok(self
            .state()
            .items
            .iter()
            .filter(|i| i.job_id == job_id && i.status == status)
            .count() as u64)
    }

    async fn reset_failed_clone_items(&self, job_id: &str) -> DbResult<u64> {
        let mut state = self.state();
        let now = now_millis();
        let mut reset = 0u64;
        for item in state
            .items
            .iter_mut()
            .filter(|i| i.job_id == job_id && i.status == CloneItemStatus::Failed)
        {
            item.status = CloneItemStatus::Pending;
            item.retry_count = 0;
            item.error_message = None;
            item.updated_at = now;
            reset += 1;
        }
        if let Some(job) = state.job_mut(job_id) {
            job.failed_items = job.failed_items.saturating_sub(reset);
            job.updated_at = now;
        }
        Ok(reset)
    }

    async fn reset_interrupted_clone_items(&self) -> DbResult<u64> {
        let mut state = self.state();
        let now = now_millis();
        let mut reset = 0u64;
        for item in state
            .items
            .iter_mut()
            .filter(|i| i.status == CloneItemStatus::Active)
        {
            item.status = CloneItemStatus::Pending;
            item.updated_at = now;
            reset += 1;
        }
        Ok(reset)
    }

    async fn delete_clone_job(&self, id: &str) -> DbResult<bool> {
        let mut state = self.state();
        state.items.retain(|i| i.job_id != id);
        let before = state.jobs.len();
        state.jobs.retain(|j| j.id != id);
        Ok(state.jobs.len() != before)
    }
}

#[async_trait]
impl MultipartRepository for MemoryStore {
    async fn save_multipart_session(&self, session: &MultipartSession) -> DbResult<()> {
        let mut stored = session.clone();
        stored.parts.clear();
        self.state()
            .sessions
            .insert(session.owner_id.clone(), stored);
        Ok(())
    }

    async fn get_multipart_session(&self, owner_id: &str) -> DbResult<Option<MultipartSession>> {
        Ok(self.state().sessions.get(owner_id).cloned())
    }

    async fn save_multipart_part(&self, owner_id: &str, part: &StoredPart) -> DbResult<()> {
        let mut state = self.state();
        let Some(session) = state.sessions.get_mut(owner_id) else {
            return Err(format!("No multipart session for {}", owner_id).into());
        };
        session.parts.retain(|p| p.part_number != part.part_number);
        session.parts.push(part.clone());
        session.parts.sort_by_key(|p| p.part_number);
        Ok(())
    }

    async fn delete_multipart_session(&self, owner_id: &str) -> DbResult<()> {
        self.state().sessions.remove(owner_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(id: &str, created_at: i64) -> TransferQueueItem {
        TransferQueueItem {
            id: id.to_string(),
            direction: TransferDirection::Download,
            target_id: "t".to_string(),
            bucket: "b".to_string(),
            key: id.to_string(),
            source_path: None,
            destination_path: Some(format!("/tmp/{}", id)),
            total_bytes: None,
            transferred_bytes: 0,
            status: TransferStatus::Queued,
            retry_count: 0,
            error_message: None,
            created_at,
            updated_at: created_at,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_transfer_ids_are_rejected() {
        let store = MemoryStore::new();
        store.insert_transfer(&queued("a", 1)).await.unwrap();
        assert!(store.insert_transfer(&queued("a", 2)).await.is_err());
    }

    #[tokio::test]
    async fn queued_items_come_out_oldest_first() {
        let store = MemoryStore::new();
        store.insert_transfer(&queued("late", 30)).await.unwrap();
        store.insert_transfer(&queued("early", 10)).await.unwrap();
        store.insert_transfer(&queued("middle", 20)).await.unwrap();

        let next = store
            .next_queued_transfers(TransferDirection::Download, 2)
            .await
            .unwrap();
        let ids: Vec<&str> = next.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "middle"]);
    }

    #[tokio::test]
    async fn parts_require_a_session() {
        let store = MemoryStore::new();
        let part = StoredPart {
            part_number: 1,
            etag: "e".to_string(),
            size: 5,
        };
        assert!(store.save_multipart_part("nobody", &part).await.is_err());
    }
}
