//! Engine settings with defaults matching the desktop client's transfer preferences

use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{EngineError, EngineResult};

const MIB: u64 = 1024 * 1024;

/// S3 rejects non-final parts smaller than this.
pub const MIN_PART_SIZE: u64 = 5 * MIB;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub concurrent_uploads: usize,
    pub concurrent_downloads: usize,
    pub concurrent_clone_items: usize,
    pub multipart_threshold: u64,
    pub part_size: u64,
    pub max_concurrent_parts: usize,
    pub auto_retry: bool,
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
    pub verify_checksum: bool,
    pub clone_item_max_retries: u32,
    pub enumeration_max_retries: u32,
    pub progress_interval_ms: u64,
    pub status_event_capacity: usize,
    pub progress_event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrent_uploads: 3,
            concurrent_downloads: 5,
            concurrent_clone_items: 5,
            multipart_threshold: 100 * MIB,
            part_size: 8 * MIB,
            max_concurrent_parts: 4,
            auto_retry: true,
            retry_count: 3,
            retry_backoff_ms: 500,
            verify_checksum: false,
            clone_item_max_retries: 3,
            enumeration_max_retries: 3,
            progress_interval_ms: 250,
            status_event_capacity: 1024,
            progress_event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Read settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.concurrent_uploads == 0
            || self.concurrent_downloads == 0
            || self.concurrent_clone_items == 0
            || self.max_concurrent_parts == 0
        {
            return Err(EngineError::Config(
                "Concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.part_size == 0 {
            return Err(EngineError::Config("Part size must be non-zero".to_string()));
        }
        if self.multipart_threshold < self.part_size {
            return Err(EngineError::Config(format!(
                "Multipart threshold {} is smaller than part size {}",
                self.multipart_threshold, self.part_size
            )));
        }
        if self.part_size < MIN_PART_SIZE {
            warn!(
                "config: part_size={} below S3 minimum {}, providers may reject multipart uploads",
                self.part_size, MIN_PART_SIZE
            );
        }
        Ok(())
    }

    /// Exponential backoff for the given zero-based attempt.
    pub(crate) fn backoff(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u64 << attempt.min(10);
        std::time::Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    pub(crate) fn progress_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.progress_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_transfer_preferences() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrent_uploads, 3);
        assert_eq!(config.concurrent_downloads, 5);
        assert_eq!(config.multipart_threshold, 100 * 1024 * 1024);
        assert_eq!(config.part_size, 8 * 1024 * 1024);
        assert_eq!(config.retry_count, 3);
        assert!(config.auto_retry);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"concurrentUploads": 7, "verifyChecksum": true}}"#).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.concurrent_uploads, 7);
        assert!(config.verify_checksum);
        assert_eq!(config.concurrent_downloads, 5);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn validate_rejects_zero_concurrency_and_small_threshold() {
        let config = EngineConfig {
            concurrent_downloads: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig {
            multipart_threshold: 1024,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = EngineConfig {
            retry_backoff_ms: 100,
            ..EngineConfig::default()
        };
        assert_eq!(config.backoff(0).as_millis(), 100);
        assert_eq!(config.backoff(2).as_millis(), 400);
    }
}
