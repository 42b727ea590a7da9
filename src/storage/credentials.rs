use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{StorageError, StorageResult};

/// Connection settings for one storage target (account + endpoint).
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    pub id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Full endpoint URL for non-AWS providers, e.g. `https://<account>.r2.cloudflarestorage.com`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

fn default_region() -> String {
    "auto".to_string()
}

// Keep secrets out of logs.
impl std::fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetConfig")
            .field("id", &self.id)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("force_path_style", &self.force_path_style)
            .finish_non_exhaustive()
    }
}

/// Looks up credentials for a target on every storage call.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, target_id: &str) -> StorageResult<TargetConfig>;
}

/// Fixed set of targets, e.g. handed over by the host after unlocking its vault.
#[derive(Debug, Clone, Default)]
pub struct StaticTargets {
    targets: HashMap<String, TargetConfig>,
}

impl StaticTargets {
    pub fn new(targets: impl IntoIterator<Item = TargetConfig>) -> Self {
        Self {
            targets: targets.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticTargets {
    async fn resolve(&self, target_id: &str) -> StorageResult<TargetConfig> {
        self.targets
            .get(target_id)
            .cloned()
            .ok_or_else(|| StorageError::Other(format!("Unknown storage target: {}", target_id)))
    }
}
