use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{from_db_int, to_db_int, DbResult, MultipartRepository, TursoStore};

/// A multipart upload in progress, owned by a transfer item or a clone item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultipartSession {
    pub owner_id: String,
    pub target_id: String,
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_size: u64,
    /// Parts confirmed by the provider, ordered by part number.
    pub parts: Vec<StoredPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredPart {
    pub part_number: i32,
    pub etag: String,
    pub size: u64,
}

/// Get SQL for creating multipart session tables
pub fn get_table_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS multipart_sessions (
        owner_id TEXT PRIMARY KEY,
        target_id TEXT NOT NULL,
        bucket TEXT NOT NULL,
        object_key TEXT NOT NULL,
        upload_id TEXT NOT NULL,
        part_size INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS multipart_parts (
        owner_id TEXT NOT NULL,
        part_number INTEGER NOT NULL,
        etag TEXT NOT NULL,
        size INTEGER NOT NULL,
        PRIMARY KEY (owner_id, part_number)
    );

    CREATE INDEX IF NOT EXISTS idx_multipart_parts_owner ON multipart_parts(owner_id);
    "
}

#[async_trait]
impl MultipartRepository for TursoStore {
    async fn save_multipart_session(&self, session: &MultipartSession) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO multipart_sessions
             (owner_id, target_id, bucket, object_key, upload_id, part_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            turso::params![
                session.owner_id.clone(),
                session.target_id.clone(),
                session.bucket.clone(),
                session.key.clone(),
                session.upload_id.clone(),
                to_db_int(session.part_size),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_multipart_session(&self, owner_id: &str) -> DbResult<Option<MultipartSession>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT target_id, bucket, object_key, upload_id, part_size
                 FROM multipart_sessions WHERE owner_id = ?1",
                turso::params![owner_id],
            )
            .await?;
        let mut session = match rows.next().await? {
            Some(row) => MultipartSession {
                owner_id: owner_id.to_string(),
                target_id: row.get(0)?,
                bucket: row.get(1)?,
                key: row.get(2)?,
                upload_id: row.get(3)?,
                part_size: from_db_int(row.get(4)?),
                parts: Vec::new(),
            },
            None => return Ok(None),
        };
        drop(rows);

        let mut rows = conn
            .query(
                "SELECT part_number, etag, size FROM multipart_parts
                 WHERE owner_id = ?1 ORDER BY part_number ASC",
                turso::params![owner_id],
            )
            .await?;
        while let Some(row) = rows.next().await? {
            session.parts.push(StoredPart {
                part_number: row.get::<i64>(0)? as i32,
                etag: row.get(1)?,
                size: from_db_int(row.get(2)?),
            });
        }
        Ok(Some(session))
    }

    async fn save_multipart_part(&self, owner_id: &str, part: &StoredPart) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO multipart_parts (owner_id, part_number, etag, size)
             VALUES (?1, ?2, ?3, ?4)",
            turso::params![
                owner_id,
                part.part_number as i64,
                part.etag.clone(),
                to_db_int(part.size),
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_multipart_session(&self, owner_id: &str) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM multipart_parts WHERE owner_id = ?1",
            turso::params![owner_id],
        )
        .await?;
        conn.execute(
            "DELETE FROM multipart_sessions WHERE owner_id = ?1",
            turso::params![owner_id],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(owner: &str) -> MultipartSession {
        MultipartSession {
            owner_id: owner.to_string(),
            target_id: "r2-main".to_string(),
            bucket: "videos".to_string(),
            key: "big.mov".to_string(),
            upload_id: "upload-1".to_string(),
            part_size: 8 * 1024 * 1024,
            parts: Vec::new(),
        }
    }

    #[tokio::test]
    async fn parts_are_returned_in_order_and_deleted_with_session() {
        let store = TursoStore::open_in_memory().await.unwrap();
        store.save_multipart_session(&session("t1")).await.unwrap();
        for n in [3, 1, 2] {
            store
                .save_multipart_part(
                    "t1",
                    &StoredPart {
                        part_number: n,
                        etag: format!("etag-{}", n),
                        size: 100,
                    },
                )
                .await
                .unwrap();
        }
        // Re-sent part replaces the earlier record.
        store
            .save_multipart_part(
                "t1",
                &StoredPart {
                    part_number: 2,
                    etag: "etag-2b".to_string(),
                    size: 100,
                },
            )
            .await
            .unwrap();

        let loaded = store.get_multipart_session("t1").await.unwrap().unwrap();
        assert_eq!(loaded.upload_id, "upload-1");
        let numbers: Vec<i32> = loaded.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(loaded.parts[1].etag, "etag-2b");

        store.delete_multipart_session("t1").await.unwrap();
        assert!(store.get_multipart_session("t1").await.unwrap().is_none());
    }
}
