use crate::config::S3Config;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// User metadata attached to uploaded objects.
pub type ObjectMetadata = BTreeMap<String, String>;

/// Errors returned by object store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("{operation} of {key} failed: {message}")]
    Request {
        operation: &'static str,
        key: String,
        message: String,
    },

    #[error("upload of {0} was cancelled")]
    Cancelled(String),
}

impl ObjectStoreError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ObjectStoreError::Request { .. })
    }
}

/// Narrow object store interface used by the remote sink and allocator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`, replacing any existing object.
    async fn upload(
        &self,
        key: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
    ) -> Result<(), ObjectStoreError>;

    /// Distinct "directories" directly below `prefix`, each returned as a
    /// full prefix ending in `/`. Objects stored deeper are not enumerated.
    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    /// Store `body` under `key` only if no object exists there yet.
    ///
    /// Returns `false` when the key was already taken.
    async fn put_if_absent(&self, key: &str, body: Bytes) -> Result<bool, ObjectStoreError>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store client
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            key_prefix = %config.key_prefix,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Simple single-part upload for small objects
    async fn simple_upload(
        &self,
        key: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
    ) -> Result<(), ObjectStoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(get_content_type(key));

        for (name, value) in metadata {
            request = request.metadata(name, value);
        }

        request
            .send()
            .await
            .map_err(|e| request_error("put_object", key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    /// Multipart upload for large objects
    async fn multipart_upload(
        &self,
        key: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
    ) -> Result<(), ObjectStoreError> {
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(get_content_type(key));

        for (name, value) in metadata {
            create = create.metadata(name, value);
        }

        let create_response = create
            .send()
            .await
            .map_err(|e| request_error("create_multipart_upload", key, DisplayErrorContext(&e)))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| request_error("create_multipart_upload", key, "no upload ID in response"))?;

        let part_size = self.config.part_size_bytes.max(1);
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut offset = 0;

        while offset < body.len() {
            let end = (offset + part_size).min(body.len());

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(body.slice(offset..end)))
                .send()
                .await
                .map_err(|e| request_error("upload_part", key, DisplayErrorContext(&e)))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );

            part_number += 1;
            offset = end;
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| request_error("complete_multipart_upload", key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body, metadata), fields(size_bytes = body.len()))]
    async fn upload(
        &self,
        key: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
    ) -> Result<(), ObjectStoreError> {
        if body.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, body, metadata).await?;
        } else {
            self.simple_upload(key, body, metadata).await?;
        }

        debug!(key, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut prefixes = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter("/")
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| request_error("list_objects_v2", prefix, DisplayErrorContext(&e)))?;

            prefixes.extend(
                response
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(prefixes)
    }

    #[instrument(skip(self, body))]
    async fn put_if_absent(&self, key: &str, body: Bytes) -> Result<bool, ObjectStoreError> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(ByteStream::from(body))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let status = e.raw_response().map(|r| r.status().as_u16());
                // 412: key exists; 409: a concurrent conditional write won
                if matches!(status, Some(412) | Some(409)) {
                    debug!(key, status, "Conditional put lost");
                    Ok(false)
                } else {
                    Err(request_error("put_object", key, DisplayErrorContext(&e)))
                }
            }
        }
    }
}

fn request_error(
    operation: &'static str,
    key: &str,
    message: impl std::fmt::Display,
) -> ObjectStoreError {
    ObjectStoreError::Request {
        operation,
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Get content type from an object key's extension
fn get_content_type(key: &str) -> &'static str {
    let extension = key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();

    match extension.to_lowercase().as_str() {
        "png" => "image/png",
        "jpeg" | "jpg" => "image/jpeg",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}
