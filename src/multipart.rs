//! Single-request and multipart object transfers with persisted resume
//!
//! Shared by the transfer queue (file <-> bucket) and the clone engine
//! (bucket -> bucket across targets). Multipart uploads record their upload
//! id and every confirmed part under an owner id, so a restarted transfer of
//! the same owner only sends what is missing.

use async_trait::async_trait;
use base64::Engine as _;
use futures_util::{stream, StreamExt};
use log::{debug, info, warn};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::config::EngineConfig;
use crate::db::{MultipartSession, Store, StoredPart};
use crate::error::{EngineError, EngineResult};
use crate::storage::{CompletedPart, StorageClient, StorageError};

/// S3 rejects part numbers above this.
const MAX_PARTS: u64 = 10_000;

/// Where the bytes of an upload come from.
#[derive(Debug, Clone)]
pub(crate) enum PartSource {
    File(PathBuf),
    /// Ranged reads against another target (cross-target clone).
    Object {
        target: String,
        bucket: String,
        key: String,
    },
}

/// Destination (or source, for downloads) object address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjectRef<'a> {
    pub target: &'a str,
    pub bucket: &'a str,
    pub key: &'a str,
}

/// Receives the cumulative byte count of a running transfer.
#[async_trait]
pub(crate) trait ProgressSink: Send + Sync {
    async fn report(&self, transferred: u64);
}

/// Sink for callers that only care about the outcome.
pub(crate) struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _transferred: u64) {}
}

pub(crate) struct Transfer<'a> {
    pub storage: &'a dyn StorageClient,
    pub store: &'a dyn Store,
    pub config: &'a EngineConfig,
    pub cancel: &'a AtomicBool,
}

fn md5_digest(bytes: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// S3's multipart ETag: md5 over the concatenated part digests, then `-N`.
/// `None` when a part ETag is not a plain MD5.
fn composite_etag(part_etags: &[&str]) -> Option<String> {
    let mut hasher = Md5::new();
    for etag in part_etags {
        let raw = hex::decode(etag).ok()?;
        if raw.len() != 16 {
            return None;
        }
        hasher.update(&raw);
    }
    Some(format!(
        "{}-{}",
        hex::encode(hasher.finalize()),
        part_etags.len()
    ))
}

/// Single-part ETags are the hex MD5 of the body; multipart ones are not.
pub(crate) fn is_plain_md5(etag: &str) -> bool {
    etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit())
}

fn source_changed(expected: u64, actual: u64) -> EngineError {
    EngineError::InvalidTransferSpec(format!(
        "Source changed size: expected {} bytes, found {}",
        expected, actual
    ))
}

fn part_range(part_number: i32, part_size: u64, total: u64) -> (u64, u64) {
    let start = (part_number as u64 - 1) * part_size;
    let end = std::cmp::min(start + part_size, total) - 1;
    (start, end)
}

/// Configured part size, grown just enough to keep `size` within
/// [`MAX_PARTS`] parts.
fn session_part_size(size: u64, configured: u64) -> u64 {
    configured.max(1).max(size.div_ceil(MAX_PARTS))
}

pub(crate) fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

impl<'a> Transfer<'a> {
    fn check_cancel(&self) -> EngineResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn read_range(&self, source: &PartSource, start: u64, end: u64) -> EngineResult<Vec<u8>> {
        let len = (end - start + 1) as usize;
        let bytes = match source {
            PartSource::File(path) => {
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(start)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                buf
            }
            PartSource::Object {
                target,
                bucket,
                key,
            } => {
                self.storage
                    .get_object(target, bucket, key, Some((start, end)))
                    .await?
            }
        };
        if bytes.len() != len {
            return Err(EngineError::TransientIo(format!(
                "Short read: expected {} bytes at offset {}, got {}",
                len,
                start,
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    async fn source_len(&self, source: &PartSource) -> EngineResult<u64> {
        match source {
            PartSource::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            PartSource::Object {
                target,
                bucket,
                key,
            } => {
                let entry = self
                    .storage
                    .head_object(target, bucket, key)
                    .await?
                    .ok_or_else(|| StorageError::NotFound {
                        bucket: bucket.clone(),
                        key: key.clone(),
                    })?;
                Ok(entry.size)
            }
        }
    }

    /// The source must still hold exactly `size` bytes, or the object we
    /// write would be a truncated or mixed copy.
    async fn ensure_source_len(&self, source: &PartSource, size: u64) -> EngineResult<()> {
        let actual = self.source_len(source).await?;
        if actual != size {
            return Err(source_changed(size, actual));
        }
        Ok(())
    }

    async fn read_all(&self, source: &PartSource, size: u64) -> EngineResult<Vec<u8>> {
        match source {
            PartSource::File(path) => Ok(tokio::fs::read(path).await?),
            PartSource::Object {
                target,
                bucket,
                key,
            } => {
                if size == 0 {
                    return Ok(Vec::new());
                }
                Ok(self.storage.get_object(target, bucket, key, None).await?)
            }
        }
    }

    /// Upload `size` bytes from `source` to `dest`, using multipart above
    /// the configured threshold.
    pub(crate) async fn upload(
        &self,
        owner_id: &str,
        source: &PartSource,
        dest: ObjectRef<'_>,
        size: u64,
        sink: &dyn ProgressSink,
    ) -> EngineResult<()> {
        self.check_cancel()?;
        self.ensure_source_len(source, size).await?;
        if size > self.config.multipart_threshold {
            self.upload_multipart(owner_id, source, dest, size, sink).await
        } else {
            self.upload_single(owner_id, source, dest, size, sink).await
        }
    }

    async fn upload_single(
        &self,
        owner_id: &str,
        source: &PartSource,
        dest: ObjectRef<'_>,
        size: u64,
        sink: &dyn ProgressSink,
    ) -> EngineResult<()> {
        self.check_cancel()?;
        let body = self.read_all(source, size).await?;
        self.check_cancel()?;
        if body.len() as u64 != size {
            return Err(source_changed(size, body.len() as u64));
        }

        let digest = self.config.verify_checksum.then(|| md5_digest(&body));
        let content_md5 =
            digest.map(|d| base64::engine::general_purpose::STANDARD.encode(d));
        let len = body.len() as u64;
        debug!(
            "single_put_start: {} key={} bytes={}",
            owner_id, dest.key, len
        );

        let etag = self
            .storage
            .put_object(dest.target, dest.bucket, dest.key, body, content_md5)
            .await?;

        if let (Some(digest), Some(etag)) = (digest, etag.as_deref()) {
            let expected = hex::encode(digest);
            if is_plain_md5(etag) && !etag.eq_ignore_ascii_case(&expected) {
                return Err(EngineError::ChecksumMismatch {
                    key: dest.key.to_string(),
                    expected,
                    actual: etag.to_string(),
                });
            }
        }
        sink.report(len).await;
        Ok(())
    }

    /// Reuse the persisted session when it still points at the same object
    /// and its part size can cover `size`.
    async fn open_session(
        &self,
        owner_id: &str,
        dest: ObjectRef<'_>,
        size: u64,
    ) -> EngineResult<MultipartSession> {
        if let Some(session) = self.store.get_multipart_session(owner_id).await? {
            let same_object = session.target_id == dest.target
                && session.bucket == dest.bucket
                && session.key == dest.key
                && session.part_size > 0
                && size.div_ceil(session.part_size) <= MAX_PARTS;
            if same_object {
                info!(
                    "multipart_resume: {} upload_id={} parts_done={}",
                    owner_id,
                    session.upload_id,
                    session.parts.len()
                );
                return Ok(session);
            }
            warn!(
                "multipart_stale_session: {} upload_id={} discarding",
                owner_id, session.upload_id
            );
            discard_session(self.storage, self.store, owner_id).await;
        }

        let upload_id = self
            .storage
            .create_multipart_upload(dest.target, dest.bucket, dest.key)
            .await?;
        let session = MultipartSession {
            owner_id: owner_id.to_string(),
            target_id: dest.target.to_string(),
            bucket: dest.bucket.to_string(),
            key: dest.key.to_string(),
            upload_id,
            part_size: session_part_size(size, self.config.part_size),
            parts: Vec::new(),
        };
        self.store.save_multipart_session(&session).await?;
        Ok(session)
    }

    async fn send_part(
        &self,
        source: &PartSource,
        dest: ObjectRef<'_>,
        session: &MultipartSession,
        part_number: i32,
        total: u64,
        expired: &AtomicBool,
    ) -> EngineResult<StoredPart> {
        self.check_cancel()?;
        let (start, end) = part_range(part_number, session.part_size, total);
        let bytes = self.read_range(source, start, end).await?;
        self.check_cancel()?;

        let digest = self.config.verify_checksum.then(|| md5_digest(&bytes));
        let len = bytes.len() as u64;
        let etag = match self
            .storage
            .upload_part(
                dest.target,
                dest.bucket,
                dest.key,
                &session.upload_id,
                part_number,
                bytes,
            )
            .await
        {
            Ok(etag) => etag,
            Err(StorageError::NotFound { .. }) => {
                expired.store(true, Ordering::SeqCst);
                return Err(EngineError::TransientIo(format!(
                    "Multipart upload {} no longer exists",
                    session.upload_id
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(digest) = digest {
            let expected = hex::encode(digest);
            if !etag.eq_ignore_ascii_case(&expected) {
                return Err(EngineError::ChecksumMismatch {
                    key: format!("{} (part {})", dest.key, part_number),
                    expected,
                    actual: etag,
                });
            }
        }
        debug!(
            "multipart_part_done: {} part={} range={}..={}",
            session.owner_id, part_number, start, end
        );
        Ok(StoredPart {
            part_number,
            etag,
            size: len,
        })
    }

    async fn upload_multipart(
        &self,
        owner_id: &str,
        source: &PartSource,
        dest: ObjectRef<'_>,
        size: u64,
        sink: &dyn ProgressSink,
    ) -> EngineResult<()> {
        self.check_cancel()?;
        let session = self.open_session(owner_id, dest, size).await?;
        let total_parts = size.div_ceil(session.part_size) as i32;
        info!(
            "multipart_plan: {} total_parts={} part_size={}",
            owner_id, total_parts, session.part_size
        );

        let mut completed: HashMap<i32, StoredPart> = session
            .parts
            .iter()
            .filter(|p| p.part_number >= 1 && p.part_number <= total_parts)
            .map(|p| (p.part_number, p.clone()))
            .collect();
        let mut uploaded: u64 = completed.values().map(|p| p.size).sum();
        if uploaded > 0 {
            sink.report(uploaded).await;
        }

        let pending: Vec<i32> = (1..=total_parts)
            .filter(|n| !completed.contains_key(n))
            .collect();

        let expired = AtomicBool::new(false);
        let mut failure: Option<EngineError> = None;
        {
            let session = &session;
            let expired = &expired;
            let mut parts = stream::iter(pending)
                .map(|part_number| {
                    self.send_part(source, dest, session, part_number, size, expired)
                })
                .buffer_unordered(self.config.max_concurrent_parts.max(1));

            while let Some(result) = parts.next().await {
                match result {
                    Ok(part) => {
                        self.store.save_multipart_part(owner_id, &part).await?;
                        uploaded += part.size;
                        sink.report(uploaded).await;
                        completed.insert(part.part_number, part);
                    }
                    Err(e) => {
                        // Dropping the stream stops the parts still in flight.
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if let Some(err) = failure {
            if expired.load(Ordering::SeqCst) {
                warn!(
                    "multipart_expired: {} upload_id={} starting over on next attempt",
                    owner_id, session.upload_id
                );
                self.store.delete_multipart_session(owner_id).await?;
            }
            return Err(err);
        }

        let mut parts: Vec<StoredPart> = completed.into_values().collect();
        parts.sort_by_key(|p| p.part_number);
        if parts.len() != total_parts as usize {
            return Err(EngineError::Storage(format!(
                "Missing upload parts: {} of {}",
                parts.len(),
                total_parts
            )));
        }

        self.check_cancel()?;
        self.ensure_source_len(source, size).await?;
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect();
        let etag = self
            .storage
            .complete_multipart_upload(
                dest.target,
                dest.bucket,
                dest.key,
                &session.upload_id,
                &completed_parts,
            )
            .await?;
        self.store.delete_multipart_session(owner_id).await?;

        if self.config.verify_checksum {
            let part_etags: Vec<&str> = parts.iter().map(|p| p.etag.as_str()).collect();
            if let (Some(expected), Some(actual)) = (composite_etag(&part_etags), etag) {
                if !actual.eq_ignore_ascii_case(&expected) {
                    return Err(EngineError::ChecksumMismatch {
                        key: dest.key.to_string(),
                        expected,
                        actual,
                    });
                }
            }
        }
        info!("multipart_complete: {} parts={}", owner_id, total_parts);
        Ok(())
    }

    /// Download `size` bytes of `source` into `destination`. Bytes land in
    /// `<destination>.part`, which is renamed into place once complete.
    pub(crate) async fn download(
        &self,
        owner_id: &str,
        source: ObjectRef<'_>,
        destination: &Path,
        size: u64,
        expected_etag: Option<&str>,
        sink: &dyn ProgressSink,
    ) -> EngineResult<()> {
        self.check_cancel()?;
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let temp_path = part_path(destination);
        let result = self
            .download_to(owner_id, source, &temp_path, size, expected_etag, sink)
            .await;
        match result {
            Ok(()) => {
                tokio::fs::rename(&temp_path, destination).await?;
                info!(
                    "download_complete: {} path={} bytes={}",
                    owner_id,
                    destination.display(),
                    size
                );
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    async fn download_to(
        &self,
        owner_id: &str,
        source: ObjectRef<'_>,
        temp_path: &Path,
        size: u64,
        expected_etag: Option<&str>,
        sink: &dyn ProgressSink,
    ) -> EngineResult<()> {
        let mut file = File::create(temp_path).await?;
        let mut hasher = self.config.verify_checksum.then(Md5::new);
        let part_size = self.config.part_size.max(1);
        let total_parts = size.div_ceil(part_size) as i32;
        debug!(
            "download_plan: {} total_parts={} part_size={}",
            owner_id, total_parts, part_size
        );

        let mut written = 0u64;
        {
            // Ordered, with up to max_concurrent_parts ranges fetched ahead.
            let mut ranges = stream::iter(1..=total_parts)
                .map(|part_number| {
                    let (start, end) = part_range(part_number, part_size, size);
                    async move {
                        self.check_cancel()?;
                        let bytes = self
                            .storage
                            .get_object(source.target, source.bucket, source.key, Some((start, end)))
                            .await?;
                        if bytes.len() as u64 != end - start + 1 {
                            return Err(EngineError::TransientIo(format!(
                                "Short read: expected {} bytes at offset {}, got {}",
                                end - start + 1,
                                start,
                                bytes.len()
                            )));
                        }
                        Ok::<Vec<u8>, EngineError>(bytes)
                    }
                })
                .buffered(self.config.max_concurrent_parts.max(1));

            while let Some(result) = ranges.next().await {
                let bytes = result?;
                self.check_cancel()?;
                file.write_all(&bytes).await?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&bytes);
                }
                written += bytes.len() as u64;
                sink.report(written).await;
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let (Some(hasher), Some(etag)) = (hasher, expected_etag) {
            if is_plain_md5(etag) {
                let actual = hex::encode(hasher.finalize());
                if !actual.eq_ignore_ascii_case(etag) {
                    return Err(EngineError::ChecksumMismatch {
                        key: source.key.to_string(),
                        expected: etag.to_string(),
                        actual,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Abort the provider-side upload recorded for `owner_id` and forget it.
/// Best effort: an upload that is already gone is not an error.
pub(crate) async fn discard_session(storage: &dyn StorageClient, store: &dyn Store, owner_id: &str) {
    let session = match store.get_multipart_session(owner_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return,
        Err(e) => {
            warn!("multipart_discard_lookup_failed: {} error={}", owner_id, e);
            return;
        }
    };
    if let Err(e) = storage
        .abort_multipart_upload(
            &session.target_id,
            &session.bucket,
            &session.key,
            &session.upload_id,
        )
        .await
    {
        warn!(
            "multipart_abort_failed: {} upload_id={} error={}",
            owner_id, session.upload_id, e
        );
    }
    if let Err(e) = store.delete_multipart_session(owner_id).await {
        warn!("multipart_session_delete_failed: {} error={}", owner_id, e);
    } else {
        info!("multipart_aborted: {} upload_id={}", owner_id, session.upload_id);
    }
}
