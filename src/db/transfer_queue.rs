use async_trait::async_trait;
use turso::Row;

use super::{changes, from_db_int, sql_in_list, to_db_int, DbResult, TransferRepository, TursoStore};
use crate::model::{now_millis, TransferDirection, TransferQueueItem, TransferStatus};

/// Get SQL for creating transfer queue tables
pub fn get_table_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS transfer_queue (
        id TEXT PRIMARY KEY,
        direction TEXT NOT NULL,
        target_id TEXT NOT NULL,
        bucket TEXT NOT NULL,
        object_key TEXT NOT NULL,
        source_path TEXT,
        destination_path TEXT,
        total_bytes INTEGER,
        transferred_bytes INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'queued',
        retry_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        completed_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_transfer_queue_status ON transfer_queue(direction, status);
    CREATE INDEX IF NOT EXISTS idx_transfer_queue_created ON transfer_queue(created_at);
    "
}

const SELECT_COLUMNS: &str = "SELECT id, direction, target_id, bucket, object_key, source_path,
        destination_path, total_bytes, transferred_bytes, status, retry_count, error_message,
        created_at, updated_at, completed_at
     FROM transfer_queue";

fn item_from_row(row: &Row) -> DbResult<TransferQueueItem> {
    let direction: String = row.get(1)?;
    let status: String = row.get(9)?;
    let total_bytes: Option<i64> = row.get(7)?;
    Ok(TransferQueueItem {
        id: row.get(0)?,
        direction: direction.into(),
        target_id: row.get(2)?,
        bucket: row.get(3)?,
        key: row.get(4)?,
        source_path: row.get(5)?,
        destination_path: row.get(6)?,
        total_bytes: total_bytes.map(from_db_int),
        transferred_bytes: from_db_int(row.get(8)?),
        status: status.into(),
        retry_count: from_db_int(row.get(10)?) as u32,
        error_message: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

fn status_list(statuses: &[TransferStatus]) -> String {
    sql_in_list(statuses.iter().map(|s| s.as_str()))
}

const TERMINAL: [TransferStatus; 3] = [
    TransferStatus::Completed,
    TransferStatus::Failed,
    TransferStatus::Cancelled,
];

#[async_trait]
impl TransferRepository for TursoStore {
    async fn insert_transfer(&self, item: &TransferQueueItem) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO transfer_queue
             (id, direction, target_id, bucket, object_key, source_path, destination_path,
              total_bytes, transferred_bytes, status, retry_count, error_message,
              created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            turso::params![
                item.id.clone(),
                item.direction.as_str(),
                item.target_id.clone(),
                item.bucket.clone(),
                item.key.clone(),
                item.source_path.clone(),
                item.destination_path.clone(),
                item.total_bytes.map(to_db_int),
                to_db_int(item.transferred_bytes),
                item.status.as_str(),
                item.retry_count as i64,
                item.error_message.clone(),
                item.created_at,
                item.updated_at,
                item.completed_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_transfer(&self, id: &str) -> DbResult<Option<TransferQueueItem>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                turso::params![id],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            Ok(Some(item_from_row(&row)?))
        } else {
            Ok(None)
        }
    }

    async fn list_transfers(&self) -> DbResult<Vec<TransferQueueItem>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("{} ORDER BY created_at ASC, id ASC", SELECT_COLUMNS),
                turso::params![],
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(item_from_row(&row)?);
        }
        Ok(items)
    }

    async fn delete_transfer(&self, id: &str) -> DbResult<bool> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM transfer_queue WHERE id = ?1",
            turso::params![id],
        )
        .await?;
        Ok(changes(&conn).await? > 0)
    }

    async fn delete_terminal_transfers(&self) -> DbResult<u64> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "DELETE FROM transfer_queue WHERE status IN ({})",
                status_list(&TERMINAL)
            ),
            (),
        )
        .await?;
        changes(&conn).await
    }

    async fn count_active_transfers(&self, direction: TransferDirection) -> DbResult<u64> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM transfer_queue WHERE direction = ?1 AND status = 'active'",
                turso::params![direction.as_str()],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            Ok(from_db_int(row.get(0)?))
        } else {
            Ok(0)
        }
    }

    async fn next_queued_transfers(
        &self,
        direction: TransferDirection,
        limit: usize,
    ) -> DbResult<Vec<TransferQueueItem>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "{} WHERE direction = ?1 AND status = 'queued'
                     ORDER BY created_at ASC, id ASC LIMIT ?2",
                    SELECT_COLUMNS
                ),
                turso::params![direction.as_str(), limit as i64],
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(item_from_row(&row)?);
        }
        Ok(items)
    }

    async fn transition_transfer(
        &self,
        id: &str,
        from: &[TransferStatus],
        to: TransferStatus,
        error: Option<&str>,
    ) -> DbResult<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let conn = self.conn.lock().await;
        let now = now_millis();
        let completed_at = if to.is_terminal() { Some(now) } else { None };
        conn.execute(
            &format!(
                "UPDATE transfer_queue
                 SET status = ?1,
                     error_message = COALESCE(?2, error_message),
                     completed_at = ?3,
                     updated_at = ?4
                 WHERE id = ?5 AND status IN ({})",
                status_list(from)
            ),
            turso::params![to.as_str(), error, completed_at, now, id],
        )
        .await?;
        Ok(changes(&conn).await? > 0)
    }

    async fn set_transfer_total(&self, id: &str, total_bytes: u64) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE transfer_queue SET total_bytes = ?1, updated_at = ?2
             WHERE id = ?3",
            turso::params![to_db_int(total_bytes), now_millis(), id],
        )
        .await?;
        Ok(())
    }

    async fn update_transfer_progress(&self, id: &str, transferred_bytes: u64) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE transfer_queue
             SET transferred_bytes = CASE WHEN transferred_bytes < ?1 THEN ?1 ELSE transferred_bytes END,
                 updated_at = ?2
             WHERE id = ?3 AND status = 'active'",
            turso::params![to_db_int(transferred_bytes), now_millis(), id],
        )
        .await?;
        Ok(())
    }

    async fn complete_transfer(&self, id: &str) -> DbResult<bool> {
        let conn = self.conn.lock().await;
        let now = now_millis();
        conn.execute(
            "UPDATE transfer_queue
             SET status = 'completed',
                 total_bytes = COALESCE(total_bytes, transferred_bytes),
                 transferred_bytes = COALESCE(total_bytes, transferred_bytes),
                 error_message = NULL,
                 completed_at = ?1,
                 updated_at = ?1
             WHERE id = ?2 AND status = 'active'",
            turso::params![now, id],
        )
        .await?;
        Ok(changes(&conn).await? > 0)
    }

    async fn requeue_transfer(&self, id: &str, from: &[TransferStatus]) -> DbResult<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let conn = self.conn.lock().await;
        let now = now_millis();
        conn.execute(
            &format!(
                "UPDATE transfer_queue
                 SET status = 'queued',
                     transferred_bytes = 0,
                     retry_count = 0,
                     error_message = NULL,
                     completed_at = NULL,
                     created_at = ?1,
                     updated_at = ?1
                 WHERE id = ?2 AND status IN ({})",
                status_list(from)
            ),
            turso::params![now, id],
        )
        .await?;
        Ok(changes(&conn).await? > 0)
    }

    async fn record_transfer_retry(&self, id: &str, error: &str) -> DbResult<u32> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE transfer_queue
             SET retry_count = retry_count + 1, error_message = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'active'",
            turso::params![error, now_millis(), id],
        )
        .await?;
        let mut rows = conn
            .query(
                "SELECT retry_count FROM transfer_queue WHERE id = ?1",
                turso::params![id],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            Ok(from_db_int(row.get(0)?) as u32)
        } else {
            Ok(0)
        }
    }

    async fn reset_interrupted_transfers(&self) -> DbResult<u64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE transfer_queue
             SET status = 'queued', transferred_bytes = 0, updated_at = ?1
             WHERE status = 'active'",
            turso::params![now_millis()],
        )
        .await?;
        changes(&conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(id: &str, direction: TransferDirection, created_at: i64) -> TransferQueueItem {
        TransferQueueItem {
            id: id.to_string(),
            direction,
            target_id: "r2-main".to_string(),
            bucket: "photos".to_string(),
            key: format!("{}.jpg", id),
            source_path: Some(format!("/tmp/{}.jpg", id)),
            destination_path: None,
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

    #[test]
    fn table_sql_declares_queue_table() {
        let sql = get_table_sql();
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS transfer_queue"));
        assert!(sql.contains("completed_at INTEGER"));
    }

    #[tokio::test]
    async fn insert_and_list_in_creation_order() {
        let store = TursoStore::open_in_memory().await.unwrap();
        store
            .insert_transfer(&queued("b", TransferDirection::Upload, 20))
            .await
            .unwrap();
        store
            .insert_transfer(&queued("a", TransferDirection::Upload, 10))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list_transfers()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let item = store.get_transfer("a").await.unwrap().unwrap();
        assert_eq!(item.direction, TransferDirection::Upload);
        assert_eq!(item.source_path.as_deref(), Some("/tmp/a.jpg"));
        assert_eq!(item.total_bytes, None);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = TursoStore::open_in_memory().await.unwrap();
        store
            .insert_transfer(&queued("t1", TransferDirection::Download, 1))
            .await
            .unwrap();

        assert!(!store
            .transition_transfer("t1", &[TransferStatus::Active], TransferStatus::Failed, None)
            .await
            .unwrap());
        assert!(store
            .transition_transfer("t1", &[TransferStatus::Queued], TransferStatus::Cancelled, None)
            .await
            .unwrap());

        let item = store.get_transfer("t1").await.unwrap().unwrap();
        assert_eq!(item.status, TransferStatus::Cancelled);
        assert!(item.completed_at.is_some());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_total_follows_the_measured_size() {
        let store = TursoStore::open_in_memory().await.unwrap();
        store
            .insert_transfer(&queued("t1", TransferDirection::Upload, 1))
            .await
            .unwrap();
        store
            .transition_transfer("t1", &[TransferStatus::Queued], TransferStatus::Active, None)
            .await
            .unwrap();

        store.set_transfer_total("t1", 100).await.unwrap();
        store.set_transfer_total("t1", 500).await.unwrap();
        store.update_transfer_progress("t1", 60).await.unwrap();
        store.update_transfer_progress("t1", 30).await.unwrap();

        let item = store.get_transfer("t1").await.unwrap().unwrap();
        assert_eq!(item.total_bytes, Some(500));
        assert_eq!(item.transferred_bytes, 60);

        assert!(store.complete_transfer("t1").await.unwrap());
        let item = store.get_transfer("t1").await.unwrap().unwrap();
        assert_eq!(item.status, TransferStatus::Completed);
        assert_eq!(item.transferred_bytes, 500);
    }

    #[tokio::test]
    async fn requeue_resets_progress_and_active_counts_by_direction() {
        let store = TursoStore::open_in_memory().await.unwrap();
        store
            .insert_transfer(&queued("up", TransferDirection::Upload, 1))
            .await
            .unwrap();
        store
            .insert_transfer(&queued("down", TransferDirection::Download, 2))
            .await
            .unwrap();
        store
            .transition_transfer("up", &[TransferStatus::Queued], TransferStatus::Active, None)
            .await
            .unwrap();

        assert_eq!(
            store
                .count_active_transfers(TransferDirection::Upload)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .count_active_transfers(TransferDirection::Download)
                .await
                .unwrap(),
            0
        );

        store.update_transfer_progress("up", 40).await.unwrap();
        assert_eq!(store.record_transfer_retry("up", "timeout").await.unwrap(), 1);
        store
            .transition_transfer(
                "up",
                &[TransferStatus::Active],
                TransferStatus::Failed,
                Some("boom"),
            )
            .await
            .unwrap();

        assert!(store
            .requeue_transfer("up", &[TransferStatus::Failed, TransferStatus::Cancelled])
            .await
            .unwrap());
        let item = store.get_transfer("up").await.unwrap().unwrap();
        assert_eq!(item.status, TransferStatus::Queued);
        assert_eq!(item.transferred_bytes, 0);
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.error_message, None);
        assert!(item.created_at > 1);

        let next = store
            .next_queued_transfers(TransferDirection::Upload, 5)
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
    }

    #[tokio::test]
    async fn delete_terminal_keeps_live_items() {
        let store = TursoStore::open_in_memory().await.unwrap();
        store
            .insert_transfer(&queued("keep", TransferDirection::Upload, 1))
            .await
            .unwrap();
        store
            .insert_transfer(&queued("drop", TransferDirection::Upload, 2))
            .await
            .unwrap();
        store
            .transition_transfer("drop", &[TransferStatus::Queued], TransferStatus::Cancelled, None)
            .await
            .unwrap();

        assert_eq!(store.delete_terminal_transfers().await.unwrap(), 1);
        assert!(store.get_transfer("keep").await.unwrap().is_some());
        assert!(!store.delete_transfer("drop").await.unwrap());
    }
}
