//! S3 object store backend.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder,
    config::{Credentials, Region},
    presigning::PresigningConfig,
    types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart, ObjectIdentifier},
    Client,
};
use futures::stream::StreamExt;
use serde::Deserialize;

use super::{CompletedPart, DeleteOutcome, ObjectMetadata, ObjectStore, ObjectStream};
use crate::error::{ServerError, ServerResult};
use crate::ratelimit::{is_throttling_error, RateLimiter};

/// S3 object store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// The AWS region.
    pub region: String,

    /// The name of the bucket.
    pub bucket: String,

    /// Custom S3 endpoint.
    ///
    /// Set this if you are using an S3-compatible object storage (e.g., Minio).
    pub endpoint: Option<String>,

    /// Whether to use path-style addressing (required by most non-AWS
    /// S3-compatible stores).
    #[serde(default)]
    pub force_path_style: bool,

    /// S3 credentials.
    ///
    /// If not specified, it's read from the `AWS_ACCESS_KEY_ID` and
    /// `AWS_SECRET_ACCESS_KEY` environment variables (or IAM).
    pub credentials: Option<S3CredentialsConfig>,
}

/// S3 credential configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3CredentialsConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// The S3-backed object store.
#[derive(Debug)]
pub struct S3Backend {
    client: Client,
    bucket: String,
    rate_limiter: RateLimiter,
}

impl S3Backend {
    pub async fn new(config: S3StorageConfig, rate_limiter: RateLimiter) -> ServerResult<Self> {
        let shared_config = aws_config::load_from_env().await;
        let mut builder = S3ConfigBuilder::from(&shared_config).region(Region::new(config.region));

        if let Some(credentials) = &config.credentials {
            builder = builder.credentials_provider(Credentials::new(
                &credentials.access_key_id,
                &credentials.secret_access_key,
                None,
                None,
                "niks3",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        } else if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
            rate_limiter,
        })
    }

    /// Runs an S3 call through the rate limiter, classifying the outcome.
    async fn guarded<T, E, F>(&self, fut: F) -> ServerResult<T>
    where
        F: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.rate_limiter.wait().await;

        match fut.await {
            Ok(v) => {
                self.rate_limiter.record_success().await;
                Ok(v)
            }
            Err(e) => {
                let display = e.to_string();
                if is_throttling_error(&display) {
                    self.rate_limiter.record_throttle().await;
                    Err(ServerError::S3Throttled)
                } else {
                    Err(ServerError::storage_error(anyhow::anyhow!(display)))
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    async fn presign_put(&self, key: &str, ttl: Duration) -> ServerResult<String> {
        let presign_config = PresigningConfig::expires_in(ttl).map_err(ServerError::storage_error)?;

        let presigned = self
            .guarded(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .presigned(presign_config),
            )
            .await?;

        Ok(presigned.uri().to_string())
    }

    async fn init_multipart(&self, key: &str) -> ServerResult<String> {
        let multipart = self
            .guarded(
                self.client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .send(),
            )
            .await?;

        multipart
            .upload_id()
            .map(str::to_owned)
            .ok_or_else(|| ServerError::storage_error(anyhow::anyhow!("S3 did not return an upload ID")))
    }

    async fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        ttl: Duration,
    ) -> ServerResult<String> {
        let presign_config = PresigningConfig::expires_in(ttl).map_err(ServerError::storage_error)?;

        let presigned = self
            .guarded(
                self.client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .presigned(presign_config),
            )
            .await?;

        Ok(presigned.uri().to_string())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ServerResult<()> {
        let completed_parts = parts
            .into_iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag)
                    .build()
            })
            .collect::<Vec<_>>();

        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.guarded(
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .multipart_upload(completed_multipart_upload)
                .send(),
        )
        .await?;

        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> ServerResult<()> {
        self.guarded(
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .send(),
        )
        .await?;

        Ok(())
    }

    async fn put_object(
        &self,
        key: &str,
        body: bytes::Bytes,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> ServerResult<()> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body.into())
            .content_type(content_type);

        if let Some(encoding) = content_encoding {
            req = req.content_encoding(encoding);
        }

        self.guarded(req.send()).await?;

        Ok(())
    }

    async fn stat_object(&self, key: &str) -> ServerResult<Option<ObjectMetadata>> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                self.rate_limiter.record_success().await;
                Ok(Some(ObjectMetadata {
                    size: output.content_length().unwrap_or(0),
                    last_modified: output
                        .last_modified()
                        .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0))
                        .unwrap_or_else(chrono::Utc::now),
                    etag: output.e_tag().map(str::to_owned),
                }))
            }
            Err(e) => {
                let display = e.to_string();
                if display.contains("NotFound") || display.contains("NoSuchKey") {
                    self.rate_limiter.record_success().await;
                    Ok(None)
                } else if is_throttling_error(&display) {
                    self.rate_limiter.record_throttle().await;
                    Err(ServerError::S3Throttled)
                } else {
                    Err(ServerError::storage_error(anyhow::anyhow!(display)))
                }
            }
        }
    }

    async fn get_object(&self, key: &str) -> ServerResult<ObjectStream> {
        let output = self
            .guarded(self.client.get_object().bucket(&self.bucket).key(key).send())
            .await?;

        let stream = output.body.map(|chunk| {
            chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        });

        Ok(Box::pin(stream))
    }

    async fn bulk_delete(&self, keys: Vec<String>) -> ServerResult<Vec<(String, DeleteOutcome)>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let identifiers: std::result::Result<Vec<_>, _> = keys
            .iter()
            .map(|k| ObjectIdentifier::builder().key(k).build())
            .collect();
        let identifiers = identifiers.map_err(ServerError::storage_error)?;

        let delete = aws_sdk_s3::types::Delete::builder()
            .set_objects(Some(identifiers))
            .build()
            .map_err(ServerError::storage_error)?;

        let output = self
            .guarded(
                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send(),
            )
            .await?;

        let mut failed = std::collections::HashSet::new();
        for error in output.errors() {
            if let Some(key) = error.key() {
                failed.insert(key.to_owned());
            }
        }

        Ok(keys
            .into_iter()
            .map(|k| {
                if failed.contains(&k) {
                    (k, DeleteOutcome::Failed("S3 reported a per-key error".into()))
                } else {
                    (k, DeleteOutcome::Deleted)
                }
            })
            .collect())
    }
}
