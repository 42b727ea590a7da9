//! Engine error taxonomy

use thiserror::Error;

use crate::storage::StorageError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Upload without a source path, download without a destination path.
    #[error("Invalid transfer: {0}")]
    InvalidTransferSpec(String),

    #[error("Source and destination are identical: {0}")]
    IdenticalSourceDestination(String),

    /// Destination scope lies inside the source scope (or the reverse).
    #[error("Source and destination overlap: {0}")]
    OverlappingScope(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Cannot {action} {kind} while it is {status}")]
    InvalidStateTransition {
        kind: &'static str,
        action: &'static str,
        status: String,
    },

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Enumeration failed: {0}")]
    EnumerationFailed(String),

    /// Cooperative stop requested by the user. Never recorded on an item.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn invalid_transition(
        kind: &'static str,
        action: &'static str,
        status: impl ToString,
    ) -> Self {
        EngineError::InvalidStateTransition {
            kind,
            action,
            status: status.to_string(),
        }
    }

    /// Only transient network failures are eligible for automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientIo(_))
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Transient(message) => EngineError::TransientIo(message),
            StorageError::AccessDenied(message) => EngineError::PermissionDenied(message),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for EngineError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        EngineError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_onto_engine_taxonomy() {
        let transient: EngineError = StorageError::Transient("timeout".into()).into();
        assert!(transient.is_retryable());

        let denied: EngineError = StorageError::AccessDenied("403".into()).into();
        assert!(matches!(denied, EngineError::PermissionDenied(_)));
        assert!(!denied.is_retryable());

        let missing: EngineError = StorageError::NotFound {
            bucket: "b".into(),
            key: "k".into(),
        }
        .into();
        assert!(matches!(missing, EngineError::Storage(_)));
    }

    #[test]
    fn invalid_transition_message_names_state() {
        let err = EngineError::invalid_transition("clone job", "pause", "completed");
        assert_eq!(err.to_string(), "Cannot pause clone job while it is completed");
    }
}
