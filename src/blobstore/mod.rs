//! Blob storage port
//!
//! Object storage behind a narrow trait: S3-compatible in production, an
//! in-memory map in tests. Artifact keys are deterministic functions of the
//! owning ids, so every upload can use create-if-absent semantics and
//! replays never duplicate work.

pub mod keys;
pub mod memory;
pub mod s3;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryBlobStore;
pub use s3::S3BlobStore;

/// Logical bucket names, resolved from configuration.
#[derive(Debug, Clone)]
pub struct Buckets {
    pub videos: String,
    pub transcripts: String,
    pub renders: String,
    pub thumbs: String,
}

impl Buckets {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            videos: config.videos_bucket.clone(),
            transcripts: config.transcripts_bucket.clone(),
            renders: config.renders_bucket.clone(),
            thumbs: config.thumbs_bucket.clone(),
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Keys under `prefix`, unordered.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<()>;

    async fn upload(&self, bucket: &str, key: &str, src: &Path, content_type: &str) -> Result<()>;

    async fn upload_bytes(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<()>;

    async fn remove(&self, bucket: &str, key: &str) -> Result<()>;

    /// Best-effort batch delete; missing keys are not errors.
    async fn remove_batch(&self, bucket: &str, keys: &[String]) -> Result<()>;

    /// Uploads only when the key is absent. Returns whether an upload
    /// happened.
    async fn upload_if_absent(
        &self,
        bucket: &str,
        key: &str,
        src: &Path,
        content_type: &str,
    ) -> Result<bool> {
        if self.exists(bucket, key).await? {
            return Ok(false);
        }
        self.upload(bucket, key, src, content_type).await?;
        Ok(true)
    }

    /// Byte-slice variant of [`BlobStore::upload_if_absent`].
    async fn upload_bytes_if_absent(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<bool> {
        if self.exists(bucket, key).await? {
            return Ok(false);
        }
        self.upload_bytes(bucket, key, bytes, content_type).await?;
        Ok(true)
    }
}
