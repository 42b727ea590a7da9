//! Test doubles shared by the unit tests

use async_trait::async_trait;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::storage::{
    CompletedPart, ListPage, ObjectEntry, StorageClient, StorageError, StorageResult,
};

const BAD_ETAG: &str = "ffffffffffffffffffffffffffffffff";

#[derive(Debug, Clone)]
struct FakeObject {
    body: Vec<u8>,
    last_modified: i64,
    etag: String,
}

struct FakeUpload {
    target: String,
    bucket: String,
    key: String,
    parts: BTreeMap<i32, Vec<u8>>,
}

struct Failure {
    op: String,
    key: Option<String>,
    error: StorageError,
    remaining: Option<usize>,
}

fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

type ObjectKey = (String, String, String);

fn object_key(target: &str, bucket: &str, key: &str) -> ObjectKey {
    (target.to_string(), bucket.to_string(), key.to_string())
}

/// In-memory S3 with call logging, write/list gates and failure injection.
pub(crate) struct FakeStorage {
    objects: Mutex<HashMap<ObjectKey, FakeObject>>,
    uploads: Mutex<HashMap<String, FakeUpload>>,
    calls: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<Failure>>,
    write_gate: Mutex<Option<Arc<Semaphore>>>,
    list_gate: Mutex<Option<Arc<Semaphore>>>,
    page_size: AtomicUsize,
    corrupt_etags: AtomicBool,
    clock: AtomicI64,
    next_upload: AtomicUsize,
}

impl FakeStorage {
    pub(crate) fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            write_gate: Mutex::new(None),
            list_gate: Mutex::new(None),
            page_size: AtomicUsize::new(1000),
            corrupt_etags: AtomicBool::new(false),
            clock: AtomicI64::new(1_700_000_000_000),
            next_upload: AtomicUsize::new(1),
        }
    }

    pub(crate) fn insert_object(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        last_modified: i64,
    ) {
        let etag = md5_hex(&body);
        self.objects.lock().unwrap().insert(
            object_key(target, bucket, key),
            FakeObject {
                body,
                last_modified,
                etag,
            },
        );
    }

    pub(crate) fn object(&self, target: &str, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&object_key(target, bucket, key))
            .map(|o| o.body.clone())
    }

    pub(crate) fn last_modified(&self, target: &str, bucket: &str, key: &str) -> Option<i64> {
        self.objects
            .lock()
            .unwrap()
            .get(&object_key(target, bucket, key))
            .map(|o| o.last_modified)
    }

    pub(crate) fn count_calls(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == op)
            .count()
    }

    /// Calls that create or replace destination bytes.
    pub(crate) fn write_calls(&self) -> usize {
        ["put_object", "copy_object", "upload_part", "complete_multipart_upload"]
            .iter()
            .map(|op| self.count_calls(op))
            .sum()
    }

    pub(crate) fn open_uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub(crate) fn set_page_size(&self, size: usize) {
        self.page_size.store(size.max(1), Ordering::SeqCst);
    }

    pub(crate) fn corrupt_etags(&self, corrupt: bool) {
        self.corrupt_etags.store(corrupt, Ordering::SeqCst);
    }

    /// Fail `op` (optionally only for `key`) `times` times, or forever.
    pub(crate) fn fail(&self, op: &str, key: Option<&str>, error: StorageError, times: Option<usize>) {
        self.failures.lock().unwrap().push(Failure {
            op: op.to_string(),
            key: key.map(|k| k.to_string()),
            error,
            remaining: times,
        });
    }

    /// Block writes until [`FakeStorage::release_writes`] lets them through.
    pub(crate) fn hold_writes(&self) {
        *self.write_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub(crate) fn release_writes(&self, count: usize) {
        if let Some(gate) = self.write_gate.lock().unwrap().as_ref() {
            gate.add_permits(count);
        }
    }

    /// Let every held and future write through.
    pub(crate) fn open_writes(&self) {
        if let Some(gate) = self.write_gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub(crate) fn hold_listing(&self) {
        *self.list_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub(crate) fn release_listing(&self, count: usize) {
        if let Some(gate) = self.list_gate.lock().unwrap().as_ref() {
            gate.add_permits(count);
        }
    }

    pub(crate) fn open_listing(&self) {
        if let Some(gate) = self.list_gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    fn record(&self, op: &str, key: &str) -> StorageResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((op.to_string(), key.to_string()));
        let mut failures = self.failures.lock().unwrap();
        for failure in failures.iter_mut() {
            let key_matches = failure.key.as_deref().map_or(true, |k| k == key);
            if failure.op != op || !key_matches {
                continue;
            }
            match failure.remaining.as_mut() {
                Some(0) => continue,
                Some(n) => *n -= 1,
                None => {}
            }
            return Err(failure.error.clone());
        }
        Ok(())
    }

    async fn pass_gate(gate: &Mutex<Option<Arc<Semaphore>>>) {
        let gate = gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1000, Ordering::SeqCst) + 1000
    }

    fn etag_for(&self, body: &[u8]) -> String {
        if self.corrupt_etags.load(Ordering::SeqCst) {
            BAD_ETAG.to_string()
        } else {
            md5_hex(body)
        }
    }

    fn entry(key: &str, object: &FakeObject) -> ObjectEntry {
        ObjectEntry {
            key: key.to_string(),
            size: object.body.len() as u64,
            last_modified: Some(object.last_modified),
            etag: Some(object.etag.clone()),
        }
    }
}

#[async_trait]
impl StorageClient for FakeStorage {
    async fn list_objects(
        &self,
        target: &str,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> StorageResult<ListPage> {
        Self::pass_gate(&self.list_gate).await;
        self.record("list_objects", prefix)?;

        let mut entries: Vec<ObjectEntry> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((t, b, k), _)| t == target && b == bucket && k.starts_with(prefix))
            .map(|((_, _, k), o)| Self::entry(k, o))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let offset: usize = continuation_token
            .map(|t| t.parse().map_err(|_| StorageError::Other(format!("bad token {}", t))))
            .transpose()?
            .unwrap_or(0);
        let page_size = self.page_size.load(Ordering::SeqCst);
        let end = std::cmp::min(offset + page_size, entries.len());
        let page: Vec<ObjectEntry> = entries
            .get(offset..end)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        let is_truncated = end < entries.len();
        Ok(ListPage {
            entries: page,
            next_token: is_truncated.then(|| end.to_string()),
            is_truncated,
        })
    }

    async fn head_object(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
    ) -> StorageResult<Option<ObjectEntry>> {
        self.record("head_object", key)?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&object_key(target, bucket, key))
            .map(|o| Self::entry(key, o)))
    }

    async fn get_object(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> StorageResult<Vec<u8>> {
        self.record("get_object", key)?;
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(&object_key(target, bucket, key))
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        match range {
            None => Ok(object.body.clone()),
            Some((start, end)) => {
                let start = start as usize;
                let end = std::cmp::min(end as usize + 1, object.body.len());
                Ok(object.body.get(start..end).unwrap_or_default().to_vec())
            }
        }
    }

    async fn put_object(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        _content_md5: Option<String>,
    ) -> StorageResult<Option<String>> {
        Self::pass_gate(&self.write_gate).await;
        self.record("put_object", key)?;
        let etag = self.etag_for(&body);
        let object = FakeObject {
            etag: md5_hex(&body),
            body,
            last_modified: self.tick(),
        };
        self.objects
            .lock()
            .unwrap()
            .insert(object_key(target, bucket, key), object);
        Ok(Some(etag))
    }

    async fn create_multipart_upload(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
    ) -> StorageResult<String> {
        self.record("create_multipart_upload", key)?;
        let upload_id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.uploads.lock().unwrap().insert(
            upload_id.clone(),
            FakeUpload {
                target: target.to_string(),
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _target: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> StorageResult<String> {
        Self::pass_gate(&self.write_gate).await;
        self.record("upload_part", key)?;
        let etag = self.etag_for(&body);
        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        upload.parts.insert(part_number, body);
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        _target: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<Option<String>> {
        Self::pass_gate(&self.write_gate).await;
        self.record("complete_multipart_upload", key)?;
        let upload = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        let mut body = Vec::new();
        let mut digests = Vec::new();
        for part in parts {
            let bytes = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| StorageError::Other(format!("Missing part {}", part.part_number)))?;
            let mut hasher = Md5::new();
            hasher.update(bytes);
            digests.extend_from_slice(&hasher.finalize());
            body.extend_from_slice(bytes);
        }
        let etag = format!("{}-{}", md5_hex(&digests), parts.len());
        let object = FakeObject {
            body,
            last_modified: self.tick(),
            etag: etag.clone(),
        };
        self.objects
            .lock()
            .unwrap()
            .insert(object_key(&upload.target, &upload.bucket, &upload.key), object);
        Ok(Some(etag))
    }

    async fn abort_multipart_upload(
        &self,
        _target: &str,
        _bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StorageResult<()> {
        self.record("abort_multipart_upload", key)?;
        self.uploads.lock().unwrap().remove(upload_id);
        Ok(())
    }

    async fn copy_object(
        &self,
        target: &str,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> StorageResult<()> {
        Self::pass_gate(&self.write_gate).await;
        self.record("copy_object", source_key)?;
        let mut objects = self.objects.lock().unwrap();
        let mut object = objects
            .get(&object_key(target, source_bucket, source_key))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: source_bucket.to_string(),
                key: source_key.to_string(),
            })?;
        object.last_modified = self.tick();
        objects.insert(object_key(target, dest_bucket, dest_key), object);
        Ok(())
    }

    async fn delete_object(&self, target: &str, bucket: &str, key: &str) -> StorageResult<()> {
        self.record("delete_object", key)?;
        self.objects
            .lock()
            .unwrap()
            .remove(&object_key(target, bucket, key));
        Ok(())
    }

    async fn presign_get(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.record("presign_get", key)?;
        Ok(format!(
            "https://{}.fake/{}/{}?expires={}",
            target,
            bucket,
            key,
            expires_in.as_secs()
        ))
    }
}

/// Poll `check` until it holds; panics after five seconds.
pub(crate) async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_pages_through_sorted_keys() {
        let storage = FakeStorage::new();
        for key in ["p/c", "p/a", "p/b", "q/x"] {
            storage.insert_object("t", "b", key, vec![1], 1);
        }
        storage.set_page_size(2);

        let first = storage.list_objects("t", "b", "p/", None).await.unwrap();
        let keys: Vec<&str> = first.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["p/a", "p/b"]);
        assert!(first.is_truncated);

        let second = storage
            .list_objects("t", "b", "p/", first.next_token.as_deref())
            .await
            .unwrap();
        assert_eq!(second.entries.len(), 1);
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let storage = FakeStorage::new();
        storage.insert_object("t", "b", "k", vec![1, 2, 3], 1);
        storage.fail("get_object", Some("k"), StorageError::Transient("503".into()), Some(1));

        assert!(storage.get_object("t", "b", "k", None).await.is_err());
        assert_eq!(
            storage.get_object("t", "b", "k", Some((1, 2))).await.unwrap(),
            vec![2, 3]
        );
    }
}
