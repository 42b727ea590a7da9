//! Clone scope validation and source-to-destination key mapping

use crate::error::{EngineError, EngineResult};
use crate::model::CloneRequest;

fn validate_bucket(bucket: &str, side: &str) -> EngineResult<()> {
    if bucket.is_empty() {
        return Err(EngineError::InvalidInput(format!("{} bucket is required", side)));
    }
    if bucket.contains('/') || bucket.chars().any(char::is_whitespace) {
        return Err(EngineError::InvalidInput(format!(
            "{} bucket name is invalid: {:?}",
            side, bucket
        )));
    }
    Ok(())
}

fn validate_prefix(prefix: &str, side: &str) -> EngineResult<()> {
    if prefix.starts_with('/') {
        return Err(EngineError::InvalidInput(format!(
            "{} prefix must not start with '/': {:?}",
            side, prefix
        )));
    }
    if prefix.chars().any(char::is_control) {
        return Err(EngineError::InvalidInput(format!(
            "{} prefix contains control characters",
            side
        )));
    }
    Ok(())
}

/// Reject malformed input and scopes that would copy a prefix onto itself.
pub(crate) fn validate_request(request: &CloneRequest) -> EngineResult<()> {
    if request.source_target_id.trim().is_empty() || request.dest_target_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("Target id is required".to_string()));
    }
    validate_bucket(&request.source_bucket, "Source")?;
    validate_bucket(&request.dest_bucket, "Destination")?;
    validate_prefix(&request.source_prefix, "Source")?;
    validate_prefix(&request.dest_prefix, "Destination")?;

    if request.source_target_id != request.dest_target_id
        || request.source_bucket != request.dest_bucket
    {
        return Ok(());
    }
    let scope = format!(
        "{}/{}/{} -> {}/{}/{}",
        request.source_target_id,
        request.source_bucket,
        request.source_prefix,
        request.dest_target_id,
        request.dest_bucket,
        request.dest_prefix
    );
    if request.source_prefix == request.dest_prefix {
        return Err(EngineError::IdenticalSourceDestination(scope));
    }
    // Either direction would re-list what the job itself writes.
    if request.source_prefix.starts_with(&request.dest_prefix)
        || request.dest_prefix.starts_with(&request.source_prefix)
    {
        return Err(EngineError::OverlappingScope(scope));
    }
    Ok(())
}

/// `dest_prefix + (source_key - source_prefix)`, or `None` for a key the
/// listing should not have returned.
pub(crate) fn dest_key(source_prefix: &str, dest_prefix: &str, source_key: &str) -> Option<String> {
    let relative = source_key.strip_prefix(source_prefix)?;
    Some(format!("{}{}", dest_prefix, relative))
}
