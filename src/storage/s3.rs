//! `StorageClient` on top of aws-sdk-s3 (AWS, R2, MinIO, RustFS, ...)

use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use super::s3_client::{classify_sdk_error, create_s3_client, trim_etag};
use super::{
    CompletedPart, CredentialProvider, ListPage, ObjectEntry, StorageClient, StorageError,
    StorageResult,
};

/// Largest object a single CopyObject request accepts.
const MAX_SINGLE_COPY_SIZE: u64 = 5 * 1024 * 1024 * 1024;
/// Part size used when a server-side copy has to be split.
const COPY_PART_SIZE: u64 = 512 * 1024 * 1024;
const LIST_PAGE_SIZE: i32 = 1000;

pub struct S3Storage {
    credentials: Arc<dyn CredentialProvider>,
}

impl S3Storage {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { credentials }
    }

    // Credentials are resolved per call and dropped with the client.
    async fn client(&self, target: &str) -> StorageResult<Client> {
        let config = self.credentials.resolve(target).await?;
        Ok(create_s3_client(&config))
    }

    async fn copy_object_multipart(
        &self,
        client: &Client,
        copy_source: &str,
        total_size: u64,
        dest_bucket: &str,
        dest_key: &str,
    ) -> StorageResult<()> {
        info!(
            "s3_multipart_copy_start: {}/{} size={}",
            dest_bucket, dest_key, total_size
        );
        let created = client
            .create_multipart_upload()
            .bucket(dest_bucket)
            .key(dest_key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, dest_bucket, dest_key))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Other("Missing upload id".to_string()))?
            .to_string();

        let mut parts = Vec::new();
        let mut start = 0u64;
        let mut part_number = 1;
        while start < total_size {
            let end = std::cmp::min(start + COPY_PART_SIZE, total_size) - 1;
            let result = client
                .upload_part_copy()
                .bucket(dest_bucket)
                .key(dest_key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .copy_source(copy_source)
                .copy_source_range(format!("bytes={}-{}", start, end))
                .send()
                .await;
            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    let _ = client
                        .abort_multipart_upload()
                        .bucket(dest_bucket)
                        .key(dest_key)
                        .upload_id(&upload_id)
                        .send()
                        .await;
                    return Err(classify_sdk_error(err, dest_bucket, dest_key));
                }
            };
            let etag = response
                .copy_part_result()
                .and_then(|r| r.e_tag())
                .map(trim_etag)
                .unwrap_or_default();
            debug!(
                "s3_multipart_copy_part: {}/{} part={} range={}..={}",
                dest_bucket, dest_key, part_number, start, end
            );
            parts.push(
                S3CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build(),
            );
            start = end + 1;
            part_number += 1;
        }

        client
            .complete_multipart_upload()
            .bucket(dest_bucket)
            .key(dest_key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, dest_bucket, dest_key))?;
        info!("s3_multipart_copy_done: {}/{}", dest_bucket, dest_key);
        Ok(())
    }
}

fn to_millis(value: Option<&DateTime>) -> Option<i64> {
    value.and_then(|dt| dt.to_millis().ok())
}

/// Keys may contain characters that must be escaped in `x-amz-copy-source`.
fn encode_copy_source(bucket: &str, key: &str) -> String {
    let encoded_key = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", bucket, encoded_key)
}

#[async_trait]
impl StorageClient for S3Storage {
    async fn list_objects(
        &self,
        target: &str,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> StorageResult<ListPage> {
        let client = self.client(target).await?;
        let mut request = client
            .list_objects_v2()
            .bucket(bucket)
            .max_keys(LIST_PAGE_SIZE);
        if !prefix.is_empty() {
            request = request.prefix(prefix);
        }
        if let Some(token) = continuation_token {
            request = request.continuation_token(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, bucket, prefix))?;

        // Folder markers (keys ending in '/') are kept: they are objects too.
        let entries = response
            .contents()
            .iter()
            .filter_map(|obj| {
                let key = obj.key()?.to_string();
                Some(ObjectEntry {
                    key,
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: to_millis(obj.last_modified()),
                    etag: obj.e_tag().map(trim_etag),
                })
            })
            .collect();

        Ok(ListPage {
            entries,
            next_token: response.next_continuation_token().map(|s| s.to_string()),
            is_truncated: response.is_truncated().unwrap_or(false),
        })
    }

    async fn head_object(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
    ) -> StorageResult<Option<ObjectEntry>> {
        let client = self.client(target).await?;
        match client.head_object().bucket(bucket).key(key).send().await {
            Ok(response) => Ok(Some(ObjectEntry {
                key: key.to_string(),
                size: response.content_length().unwrap_or(0).max(0) as u64,
                last_modified: to_millis(response.last_modified()),
                etag: response.e_tag().map(trim_etag),
            })),
            Err(err) => match classify_sdk_error(err, bucket, key) {
                StorageError::NotFound { .. } => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn get_object(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> StorageResult<Vec<u8>> {
        let client = self.client(target).await?;
        let mut request = client.get_object().bucket(bucket).key(key);
        if let Some((start, end)) = range {
            request = request.range(format!("bytes={}-{}", start, end));
        }
        let response = request
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, bucket, key))?;
        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Transient(format!("Failed to read body: {}", e)))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn put_object(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_md5: Option<String>,
    ) -> StorageResult<Option<String>> {
        let client = self.client(target).await?;
        let response = client
            .put_object()
            .bucket(bucket)
            .key(key)
            .set_content_md5(content_md5)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, bucket, key))?;
        Ok(response.e_tag().map(trim_etag))
    }

    async fn create_multipart_upload(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
    ) -> StorageResult<String> {
        let client = self.client(target).await?;
        let response = client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, bucket, key))?;
        response
            .upload_id()
            .map(|id| id.to_string())
            .ok_or_else(|| StorageError::Other("Missing upload id".to_string()))
    }

    async fn upload_part(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> StorageResult<String> {
        let client = self.client(target).await?;
        let response = client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, bucket, key))?;
        response
            .e_tag()
            .map(trim_etag)
            .ok_or_else(|| StorageError::Other(format!("Missing ETag for part {}", part_number)))
    }

    async fn complete_multipart_upload(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<Option<String>> {
        let client = self.client(target).await?;
        let completed: Vec<S3CompletedPart> = parts
            .iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();
        let response = client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, bucket, key))?;
        Ok(response.e_tag().map(trim_etag))
    }

    async fn abort_multipart_upload(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StorageResult<()> {
        let client = self.client(target).await?;
        client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, bucket, key))?;
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
        let client = self.client(target).await?;
        let copy_source = encode_copy_source(source_bucket, source_key);

        let result = client
            .copy_object()
            .bucket(dest_bucket)
            .key(dest_key)
            .copy_source(&copy_source)
            .send()
            .await;

        let err = match result {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };

        // CopyObject is capped at 5 GiB; larger sources need UploadPartCopy.
        let too_large = matches!(
            err.code(),
            Some("InvalidRequest") | Some("EntityTooLarge")
        );
        if !too_large {
            return Err(classify_sdk_error(err, dest_bucket, dest_key));
        }
        let size = match self.head_object(target, source_bucket, source_key).await? {
            Some(entry) if entry.size > MAX_SINGLE_COPY_SIZE => entry.size,
            _ => return Err(classify_sdk_error(err, dest_bucket, dest_key)),
        };
        self.copy_object_multipart(&client, &copy_source, size, dest_bucket, dest_key)
            .await
    }

    async fn delete_object(&self, target: &str, bucket: &str, key: &str) -> StorageResult<()> {
        let client = self.client(target).await?;
        client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, bucket, key))?;
        Ok(())
    }

    async fn presign_get(
        &self,
        target: &str,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        let client = self.client(target).await?;
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::Other(format!("Invalid presign expiry: {}", e)))?;
        let presigned_request = client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| classify_sdk_error(e, bucket, key))?;
        Ok(presigned_request.uri().to_string())
    }
}
