//! Storage client capability consumed by the engine
//!
//! The engine never signs requests or parses provider responses itself. It
//! talks to S3-compatible targets through [`StorageClient`], addressed by
//! target id. [`S3Storage`] is the production implementation on top of
//! `aws-sdk-s3`.

mod credentials;
mod s3;
mod s3_client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use credentials::{CredentialProvider, StaticTargets, TargetConfig};
pub use s3::S3Storage;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Timeouts, dropped connections, throttling and 5xx responses.
    #[error("Network error: {0}")]
    Transient(String),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Object metadata from a listing or a HEAD request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub last_modified: Option<i64>,
    /// ETag without surrounding quotes.
    pub etag: Option<String>,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    pub next_token: Option<String>,
    pub is_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// List keys under `prefix` (recursive, no delimiter), one page at a time.
    async fn list_objects(
        &self,
        target: &str,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> StorageResult<ListPage>;

    /// `None` when the object does not exist.
    async fn head_object(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
    ) -> StorageResult<Option<ObjectEntry>>;

    /// Read the object, or the inclusive byte range `(start, end)` of it.
    async fn get_object(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> StorageResult<Vec<u8>>;

    /// Single-request write; returns the ETag when the provider reports one.
    async fn put_object(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_md5: Option<String>,
    ) -> StorageResult<Option<String>>;

    async fn create_multipart_upload(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
    ) -> StorageResult<String>;

    async fn upload_part(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> StorageResult<String>;

    async fn complete_multipart_upload(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<Option<String>>;

    async fn abort_multipart_upload(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StorageResult<()>;

    /// Server-side copy inside one target; no bytes flow through the client.
    async fn copy_object(
        &self,
        target: &str,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> StorageResult<()>;

    async fn delete_object(&self, target: &str, bucket: &str, key: &str) -> StorageResult<()>;

    async fn presign_get(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> StorageResult<String>;
}
