use async_trait::async_trait;
use turso::{Connection, Row};

use super::{changes, from_db_int, sql_in_list, to_db_int, CloneRepository, DbResult, TursoStore};
use crate::model::{
    now_millis, CloneItemStatus, CloneJob, CloneJobItem, CloneJobStatus, ItemOutcome,
};

/// Get SQL for creating clone job tables
pub fn get_table_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS clone_jobs (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL DEFAULT 'pending',
        source_target_id TEXT NOT NULL,
        source_bucket TEXT NOT NULL,
        source_prefix TEXT NOT NULL DEFAULT '',
        dest_target_id TEXT NOT NULL,
        dest_bucket TEXT NOT NULL,
        dest_prefix TEXT NOT NULL DEFAULT '',
        conflict_policy TEXT NOT NULL,
        is_same_target INTEGER NOT NULL DEFAULT 0,
        enumeration_token TEXT,
        enumeration_complete INTEGER NOT NULL DEFAULT 0,
        total_items INTEGER NOT NULL DEFAULT 0,
        completed_items INTEGER NOT NULL DEFAULT 0,
        failed_items INTEGER NOT NULL DEFAULT 0,
        skipped_items INTEGER NOT NULL DEFAULT 0,
        total_bytes INTEGER NOT NULL DEFAULT 0,
        transferred_bytes INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        completed_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_clone_jobs_status ON clone_jobs(status);

    CREATE TABLE IF NOT EXISTS clone_job_items (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        source_key TEXT NOT NULL,
        dest_key TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        source_etag TEXT,
        source_last_modified INTEGER,
        status TEXT NOT NULL DEFAULT 'pending',
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_clone_job_items_job ON clone_job_items(job_id, status);
    CREATE INDEX IF NOT EXISTS idx_clone_job_items_key ON clone_job_items(job_id, source_key);
    "
}

const JOB_COLUMNS: &str = "SELECT id, status, source_target_id, source_bucket, source_prefix,
        dest_target_id, dest_bucket, dest_prefix, conflict_policy, is_same_target,
        enumeration_token, enumeration_complete, total_items, completed_items, failed_items,
        skipped_items, total_bytes, transferred_bytes, error_message, created_at, updated_at,
        completed_at
     FROM clone_jobs";

const ITEM_COLUMNS: &str = "SELECT id, job_id, source_key, dest_key, size, source_etag,
        source_last_modified, status, error_message, retry_count, created_at, updated_at
     FROM clone_job_items";

fn job_from_row(row: &Row) -> DbResult<CloneJob> {
    let status: String = row.get(1)?;
    let policy: String = row.get(8)?;
    Ok(CloneJob {
        id: row.get(0)?,
        status: status.into(),
        source_target_id: row.get(2)?,
        source_bucket: row.get(3)?,
        source_prefix: row.get(4)?,
        dest_target_id: row.get(5)?,
        dest_bucket: row.get(6)?,
        dest_prefix: row.get(7)?,
        conflict_policy: policy.into(),
        is_same_target: row.get::<i64>(9)? != 0,
        enumeration_token: row.get(10)?,
        enumeration_complete: row.get::<i64>(11)? != 0,
        total_items: from_db_int(row.get(12)?),
        completed_items: from_db_int(row.get(13)?),
        failed_items: from_db_int(row.get(14)?),
        skipped_items: from_db_int(row.get(15)?),
        total_bytes: from_db_int(row.get(16)?),
        transferred_bytes: from_db_int(row.get(17)?),
        error_message: row.get(18)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
        completed_at: row.get(21)?,
    })
}

fn item_from_row(row: &Row) -> DbResult<CloneJobItem> {
    let status: String = row.get(7)?;
    Ok(CloneJobItem {
        id: row.get(0)?,
        job_id: row.get(1)?,
        source_key: row.get(2)?,
        dest_key: row.get(3)?,
        size: from_db_int(row.get(4)?),
        source_etag: row.get(5)?,
        source_last_modified: row.get(6)?,
        status: status.into(),
        error_message: row.get(8)?,
        retry_count: from_db_int(row.get(9)?) as u32,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

async fn begin(conn: &Connection) -> DbResult<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;
    Ok(())
}

/// Commit on success, roll back on error.
async fn finish<T>(conn: &Connection, result: DbResult<T>) -> DbResult<T> {
    match result {
        Ok(value) => {
            conn.execute("COMMIT", ()).await?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", ()).await;
            Err(e)
        }
    }
}

async fn insert_new_items(
    conn: &Connection,
    job_id: &str,
    items: &[CloneJobItem],
    next_token: Option<&str>,
    complete: bool,
) -> DbResult<u64> {
    let mut inserted = 0u64;
    let mut inserted_bytes = 0u64;

    for item in items {
        let mut rows = conn
            .query(
                "SELECT 1 FROM clone_job_items WHERE job_id = ?1 AND source_key = ?2 LIMIT 1",
                turso::params![job_id, item.source_key.clone()],
            )
            .await?;
        if rows.next().await?.is_some() {
            continue;
        }
        drop(rows);

        conn.execute(
            "INSERT INTO clone_job_items
             (id, job_id, source_key, dest_key, size, source_etag, source_last_modified,
              status, error_message, retry_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            turso::params![
                item.id.clone(),
                job_id,
                item.source_key.clone(),
                item.dest_key.clone(),
                to_db_int(item.size),
                item.source_etag.clone(),
                item.source_last_modified,
                item.status.as_str(),
                item.error_message.clone(),
                item.retry_count as i64,
                item.created_at,
                item.updated_at,
            ],
        )
        .await?;
        inserted += 1;
        inserted_bytes += item.size;
    }

    conn.execute(
        "UPDATE clone_jobs
         SET total_items = total_items + ?1,
             total_bytes = total_bytes + ?2,
             enumeration_token = ?3,
             enumeration_complete = ?4,
             updated_at = ?5
         WHERE id = ?6",
        turso::params![
            to_db_int(inserted),
            to_db_int(inserted_bytes),
            next_token,
            i64::from(complete),
            now_millis(),
            job_id,
        ],
    )
    .await?;
    Ok(inserted)
}

async fn apply_item_outcome(
    conn: &Connection,
    item_id: &str,
    outcome: &ItemOutcome,
) -> DbResult<bool> {
    let mut rows = conn
        .query(
            "SELECT job_id, size FROM clone_job_items WHERE id = ?1 AND status = 'active'",
            turso::params![item_id],
        )
        .await?;
    let (job_id, size): (String, i64) = match rows.next().await? {
        Some(row) => (row.get(0)?, row.get(1)?),
        None => return Ok(false),
    };
    drop(rows);

    let now = now_millis();
    match outcome {
        ItemOutcome::Completed | ItemOutcome::Skipped => {
            let (status, counter, bytes) = if *outcome == ItemOutcome::Completed {
                (CloneItemStatus::Completed, "completed_items", size)
            } else {
                (CloneItemStatus::Skipped, "skipped_items", 0)
            };
            conn.execute(
                "UPDATE clone_job_items SET status = ?1, error_message = NULL, updated_at = ?2
                 WHERE id = ?3",
                turso::params![status.as_str(), now, item_id],
            )
            .await?;
            conn.execute(
                &format!(
                    "UPDATE clone_jobs
                     SET {counter} = {counter} + 1,
                         transferred_bytes = transferred_bytes + ?1,
                         updated_at = ?2
                     WHERE id = ?3",
                    counter = counter
                ),
                turso::params![bytes, now, job_id],
            )
            .await?;
        }
        ItemOutcome::Failed(message) => {
            conn.execute(
                "UPDATE clone_job_items
                 SET status = 'failed', error_message = ?1, retry_count = retry_count + 1,
                     updated_at = ?2
                 WHERE id = ?3",
                turso::params![message.as_str(), now, item_id],
            )
            .await?;
            conn.execute(
                "UPDATE clone_jobs SET failed_items = failed_items + 1, updated_at = ?1
                 WHERE id = ?2",
                turso::params![now, job_id],
            )
            .await?;
        }
        ItemOutcome::Retry(message) => {
            conn.execute(
                "UPDATE clone_job_items
                 SET status = 'pending', error_message = ?1, retry_count = retry_count + 1,
                     updated_at = ?2
                 WHERE id = ?3",
                turso::params![message.as_str(), now, item_id],
            )
            .await?;
        }
        ItemOutcome::Released => {
            conn.execute(
                "UPDATE clone_job_items SET status = 'pending', updated_at = ?1 WHERE id = ?2",
                turso::params![now, item_id],
            )
            .await?;
        }
    }
    Ok(true)
}

async fn reset_failed(conn: &Connection, job_id: &str) -> DbResult<u64> {
    let now = now_millis();
    conn.execute(
        "UPDATE clone_job_items
         SET status = 'pending', retry_count = 0, error_message = NULL, updated_at = ?1
         WHERE job_id = ?2 AND status = 'failed'",
        turso::params![now, job_id],
    )
    .await?;
    let reset = changes(conn).await?;
    conn.execute(
        "UPDATE clone_jobs
         SET failed_items = CASE WHEN failed_items > ?1 THEN failed_items - ?1 ELSE 0 END,
             updated_at = ?2
         WHERE id = ?3",
        turso::params![to_db_int(reset), now, job_id],
    )
    .await?;
    Ok(reset)
}

async fn delete_job_rows(conn: &Connection, id: &str) -> DbResult<bool> {
    conn.execute(
        "DELETE FROM clone_job_items WHERE job_id = ?1",
        turso::params![id],
    )
    .await?;
    conn.execute("DELETE FROM clone_jobs WHERE id = ?1", turso::params![id])
        .await?;
    Ok(changes(conn).await? > 0)
}

#[async_trait]
impl CloneRepository for TursoStore {
    async fn insert_clone_job(&self, job: &CloneJob) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO clone_jobs
             (id, status, source_target_id, source_bucket, source_prefix, dest_target_id,
              dest_bucket, dest_prefix, conflict_policy, is_same_target, enumeration_token,
              enumeration_complete, total_items, completed_items, failed_items, skipped_items,
              total_bytes, transferred_bytes, error_message, created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22)",
            turso::params![
                job.id.clone(),
                job.status.as_str(),
                job.source_target_id.clone(),
                job.source_bucket.clone(),
                job.source_prefix.clone(),
                job.dest_target_id.clone(),
                job.dest_bucket.clone(),
                job.dest_prefix.clone(),
                job.conflict_policy.as_str(),
                i64::from(job.is_same_target),
                job.enumeration_token.clone(),
                i64::from(job.enumeration_complete),
                to_db_int(job.total_items),
                to_db_int(job.completed_items),
                to_db_int(job.failed_items),
                to_db_int(job.skipped_items),
                to_db_int(job.total_bytes),
                to_db_int(job.transferred_bytes),
                job.error_message.clone(),
                job.created_at,
                job.updated_at,
                job.completed_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_clone_job(&self, id: &str) -> DbResult<Option<CloneJob>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(&format!("{} WHERE id = ?1", JOB_COLUMNS), turso::params![id])
            .await?;
        if let Some(row) = rows.next().await? {
            Ok(Some(job_from_row(&row)?))
        } else {
            Ok(None)
        }
    }

    async fn list_clone_jobs(&self) -> DbResult<Vec<CloneJob>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("{} ORDER BY created_at DESC, id ASC", JOB_COLUMNS),
                turso::params![],
            )
            .await?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(job_from_row(&row)?);
        }
        Ok(jobs)
    }

    async fn transition_clone_job(
        &self,
        id: &str,
        from: &[CloneJobStatus],
        to: CloneJobStatus,
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
                "UPDATE clone_jobs
                 SET status = ?1,
                     error_message = CASE WHEN ?2 IS NOT NULL THEN ?2
                                          WHEN ?6 = 1 THEN error_message
                                          ELSE NULL END,
                     completed_at = ?3,
                     updated_at = ?4
                 WHERE id = ?5 AND status IN ({})",
                sql_in_list(from.iter().map(|s| s.as_str()))
            ),
            turso::params![
                to.as_str(),
                error,
                completed_at,
                now,
                id,
                i64::from(to.is_terminal())
            ],
        )
        .await?;
        Ok(changes(&conn).await? > 0)
    }

    async fn record_enumeration_page(
        &self,
        job_id: &str,
        items: &[CloneJobItem],
        next_token: Option<&str>,
        complete: bool,
    ) -> DbResult<u64> {
        let conn = self.conn.lock().await;
        begin(&conn).await?;
        let result = insert_new_items(&conn, job_id, items, next_token, complete).await;
        finish(&conn, result).await
    }

    async fn next_pending_clone_items(
        &self,
        job_id: &str,
        limit: usize,
    ) -> DbResult<Vec<CloneJobItem>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "{} WHERE job_id = ?1 AND status = 'pending'
                     ORDER BY created_at ASC, source_key ASC LIMIT ?2",
                    ITEM_COLUMNS
                ),
                turso::params![job_id, limit as i64],
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(item_from_row(&row)?);
        }
        Ok(items)
    }

    async fn claim_clone_item(&self, item_id: &str) -> DbResult<bool> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE clone_job_items SET status = 'active', updated_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            turso::params![now_millis(), item_id],
        )
        .await?;
        Ok(changes(&conn).await? > 0)
    }

    async fn finish_clone_item(&self, item_id: &str, outcome: &ItemOutcome) -> DbResult<bool> {
        let conn = self.conn.lock().await;
        begin(&conn).await?;
        let result = apply_item_outcome(&conn, item_id, outcome).await;
        finish(&conn, result).await
    }

    async fn get_clone_item(&self, item_id: &str) -> DbResult<Option<CloneJobItem>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("{} WHERE id = ?1", ITEM_COLUMNS),
                turso::params![item_id],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            Ok(Some(item_from_row(&row)?))
        } else {
            Ok(None)
        }
    }

    async fn list_clone_items(&self, job_id: &str) -> DbResult<Vec<CloneJobItem>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "{} WHERE job_id = ?1 ORDER BY created_at ASC, source_key ASC",
                    ITEM_COLUMNS
                ),
                turso::params![job_id],
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(item_from_row(&row)?);
        }
        Ok(items)
    }

    async fn count_clone_items(&self, job_id: &str, status: CloneItemStatus) -> DbResult<u64> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM clone_job_items WHERE job_id = ?1 AND status = ?2",
                turso::params![job_id, status.as_str()],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            Ok(from_db_int(row.get(0)?))
        } else {
            Ok(0)
        }
    }

    async fn reset_failed_clone_items(&self, job_id: &str) -> DbResult<u64> {
        let conn = self.conn.lock().await;
        begin(&conn).await?;
        let result = reset_failed(&conn, job_id).await;
        finish(&conn, result).await
    }

    async fn reset_interrupted_clone_items(&self) -> DbResult<u64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE clone_job_items SET status = 'pending', updated_at = ?1
             WHERE status = 'active'",
            turso::params![now_millis()],
        )
        .await?;
        changes(&conn).await
    }

    async fn delete_clone_job(&self, id: &str) -> DbResult<bool> {
        let conn = self.conn.lock().await;
        begin(&conn).await?;
        let result = delete_job_rows(&conn, id).await;
        finish(&conn, result).await
    }
}
