use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CloneJobStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "enumerating")]
    Enumerating,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl CloneJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloneJobStatus::Pending => "pending",
            CloneJobStatus::Enumerating => "enumerating",
            CloneJobStatus::Running => "running",
            CloneJobStatus::Paused => "paused",
            CloneJobStatus::Completed => "completed",
            CloneJobStatus::Failed => "failed",
            CloneJobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CloneJobStatus::Completed | CloneJobStatus::Failed | CloneJobStatus::Cancelled
        )
    }

    /// States in which a driver task may be doing work.
    pub(crate) const LIVE: [CloneJobStatus; 3] = [
        CloneJobStatus::Pending,
        CloneJobStatus::Enumerating,
        CloneJobStatus::Running,
    ];

    pub(crate) const NON_TERMINAL: [CloneJobStatus; 4] = [
        CloneJobStatus::Pending,
        CloneJobStatus::Enumerating,
        CloneJobStatus::Running,
        CloneJobStatus::Paused,
    ];
}

impl std::fmt::Display for CloneJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for CloneJobStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "pending" => CloneJobStatus::Pending,
            "enumerating" => CloneJobStatus::Enumerating,
            "running" => CloneJobStatus::Running,
            "paused" => CloneJobStatus::Paused,
            "completed" => CloneJobStatus::Completed,
            "failed" => CloneJobStatus::Failed,
            "cancelled" => CloneJobStatus::Cancelled,
            _ => CloneJobStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CloneItemStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "skipped")]
    Skipped,
    #[serde(rename = "failed")]
    Failed,
}

impl CloneItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloneItemStatus::Pending => "pending",
            CloneItemStatus::Active => "active",
            CloneItemStatus::Completed => "completed",
            CloneItemStatus::Skipped => "skipped",
            CloneItemStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CloneItemStatus::Completed | CloneItemStatus::Skipped | CloneItemStatus::Failed
        )
    }
}

impl std::fmt::Display for CloneItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for CloneItemStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "pending" => CloneItemStatus::Pending,
            "active" => CloneItemStatus::Active,
            "completed" => CloneItemStatus::Completed,
            "skipped" => CloneItemStatus::Skipped,
            "failed" => CloneItemStatus::Failed,
            _ => CloneItemStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConflictPolicy {
    #[serde(rename = "skip")]
    Skip,
    #[serde(rename = "overwrite")]
    Overwrite,
    #[serde(rename = "overwriteIfNewer")]
    OverwriteIfNewer,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Skip => "skip",
            ConflictPolicy::Overwrite => "overwrite",
            ConflictPolicy::OverwriteIfNewer => "overwriteIfNewer",
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ConflictPolicy {
    fn from(value: String) -> Self {
        match value.as_str() {
            "overwrite" => ConflictPolicy::Overwrite,
            "overwriteIfNewer" => ConflictPolicy::OverwriteIfNewer,
            _ => ConflictPolicy::Skip,
        }
    }
}

/// One bucket/prefix to bucket/prefix replication task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloneJob {
    pub id: String,
    pub status: CloneJobStatus,
    pub source_target_id: String,
    pub source_bucket: String,
    pub source_prefix: String,
    pub dest_target_id: String,
    pub dest_bucket: String,
    pub dest_prefix: String,
    pub conflict_policy: ConflictPolicy,
    pub is_same_target: bool,
    pub enumeration_token: Option<String>,
    pub enumeration_complete: bool,
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl CloneJob {
    /// Items in a terminal item state.
    pub fn settled_items(&self) -> u64 {
        self.completed_items + self.failed_items + self.skipped_items
    }
}

/// One object within a clone job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloneJobItem {
    pub id: String,
    pub job_id: String,
    pub source_key: String,
    pub dest_key: String,
    pub size: u64,
    pub source_etag: Option<String>,
    pub source_last_modified: Option<i64>,
    pub status: CloneItemStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input of `clone_start`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloneRequest {
    pub source_target_id: String,
    pub source_bucket: String,
    #[serde(default)]
    pub source_prefix: String,
    pub dest_target_id: String,
    pub dest_bucket: String,
    #[serde(default)]
    pub dest_prefix: String,
    pub conflict_policy: ConflictPolicy,
}

/// How an active clone item left the `active` state.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Completed,
    Skipped,
    Failed(String),
    /// Back to `pending` after a transient failure, counting one retry.
    Retry(String),
    /// Back to `pending` without counting a retry (cancelled mid-copy).
    Released,
}
