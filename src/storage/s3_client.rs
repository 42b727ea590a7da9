use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client;

use super::{StorageError, TargetConfig};

pub(crate) fn create_s3_client(config: &TargetConfig) -> Client {
    let credentials = Credentials::new(
        &config.access_key_id,
        &config.secret_access_key,
        config.session_token.clone(),
        None,
        "bucket-relay",
    );

    let mut builder = S3ConfigBuilder::new()
        .credentials_provider(credentials)
        .region(Region::new(config.region.clone()));

    if let Some(endpoint_url) = config.endpoint.as_deref().map(str::trim) {
        if !endpoint_url.is_empty() {
            builder = builder.endpoint_url(endpoint_url);
        }
    }

    if config.force_path_style {
        builder = builder.force_path_style(true);
    }

    Client::from_conf(builder.build())
}

/// Classify an SDK failure by transport outcome and HTTP status.
pub(crate) fn classify_sdk_error<E>(
    err: SdkError<E, HttpResponse>,
    bucket: &str,
    key: &str,
) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Transient(message)
        }
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            let code = context.err().code().unwrap_or_default();
            match status {
                403 => StorageError::AccessDenied(message),
                404 if code != "NoSuchBucket" => StorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                },
                408 | 429 | 500..=599 => StorageError::Transient(message),
                _ if code == "SlowDown" || code == "RequestTimeout" => {
                    StorageError::Transient(message)
                }
                _ => StorageError::Other(message),
            }
        }
        _ => StorageError::Other(message),
    }
}

/// ETags arrive quoted; the engine compares bare hex.
pub(crate) fn trim_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}
