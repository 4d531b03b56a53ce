//! The object store adapter.
//!
//! A thin wrapper over the S3 API used by the rest of the service:
//! presigned PUT URLs, multipart upload lifecycle, object HEAD/GET/DELETE,
//! and bulk delete. Every call here is expected to be wrapped by the
//! adaptive rate limiter at the call site (see `crate::ratelimit`).

mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::ServerResult;

pub use self::s3::{S3Backend, S3CredentialsConfig, S3StorageConfig};

/// Metadata returned by `StatObject`.
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub size: i64,
    pub last_modified: DateTime<Utc>,
    pub etag: Option<String>,
}

/// A completed part of a multipart upload, as reported by the client.
#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Outcome of one key in a `BulkDelete` call.
#[derive(Debug, Clone)]
pub enum DeleteOutcome {
    /// The object was deleted, or was already absent.
    Deleted,
    /// Deletion failed for a reason other than a missing key.
    Failed(String),
}

/// A byte stream returned by `GetObject`.
pub type ObjectStream = BoxStream<'static, std::io::Result<Bytes>>;

/// The object store adapter.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Issues a presigned PUT URL for a whole object, valid for `ttl`.
    async fn presign_put(&self, key: &str, ttl: std::time::Duration) -> ServerResult<String>;

    /// Initiates a multipart upload, returning its upload ID.
    async fn init_multipart(&self, key: &str) -> ServerResult<String>;

    /// Presigns a single part of a multipart upload.
    async fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        ttl: std::time::Duration,
    ) -> ServerResult<String>;

    /// Completes a multipart upload given the client-reported parts.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ServerResult<()>;

    /// Aborts a multipart upload.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> ServerResult<()>;

    /// Uploads a small object directly (used by the narinfo finalizer).
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> ServerResult<()>;

    /// Returns object metadata, or `None` if the key does not exist.
    async fn stat_object(&self, key: &str) -> ServerResult<Option<ObjectMetadata>>;

    /// Streams an object's body.
    async fn get_object(&self, key: &str) -> ServerResult<ObjectStream>;

    /// Deletes a batch of keys, reporting a per-key outcome.
    async fn bulk_delete(&self, keys: Vec<String>) -> ServerResult<Vec<(String, DeleteOutcome)>>;
}
