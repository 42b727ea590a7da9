use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    #[serde(rename = "upload")]
    Upload,
    #[serde(rename = "download")]
    Download,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        }
    }
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for TransferDirection {
    fn from(value: String) -> Self {
        match value.as_str() {
            "download" => TransferDirection::Download,
            _ => TransferDirection::Upload,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Queued => "queued",
            TransferStatus::Active => "active",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for TransferStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "queued" => TransferStatus::Queued,
            "active" => TransferStatus::Active,
            "completed" => TransferStatus::Completed,
            "failed" => TransferStatus::Failed,
            "cancelled" => TransferStatus::Cancelled,
            _ => TransferStatus::Queued,
        }
    }
}

/// One file moving between local disk and a bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferQueueItem {
    pub id: String,
    pub direction: TransferDirection,
    pub target_id: String,
    pub bucket: String,
    pub key: String,
    pub source_path: Option<String>,
    pub destination_path: Option<String>,
    pub total_bytes: Option<u64>,
    pub transferred_bytes: u64,
    pub status: TransferStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// Input of `transfer_queue_enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub direction: TransferDirection,
    pub target_id: String,
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub destination_path: Option<String>,
}

impl EnqueueRequest {
    pub fn upload(
        target_id: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        source_path: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            direction: TransferDirection::Upload,
            target_id: target_id.into(),
            bucket: bucket.into(),
            key: key.into(),
            size: None,
            source_path: Some(source_path.into()),
            destination_path: None,
        }
    }

    pub fn download(
        target_id: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        destination_path: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            direction: TransferDirection::Download,
            target_id: target_id.into(),
            bucket: bucket.into(),
            key: key.into(),
            size: None,
            source_path: None,
            destination_path: Some(destination_path.into()),
        }
    }
}

impl From<&TransferQueueItem> for EnqueueRequest {
    fn from(item: &TransferQueueItem) -> Self {
        Self {
            id: Some(item.id.clone()),
            direction: item.direction,
            target_id: item.target_id.clone(),
            bucket: item.bucket.clone(),
            key: item.key.clone(),
            size: item.total_bytes,
            source_path: item.source_path.clone(),
            destination_path: item.destination_path.clone(),
        }
    }
}
