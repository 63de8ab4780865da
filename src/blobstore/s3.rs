//! S3-compatible blob store backend
//!
//! Works against AWS S3 or any compatible endpoint (R2, minio) via the
//! endpoint override.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, WorkerError};

use super::BlobStore;

pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
}

impl S3BlobStore {
    /// Builds the client from the ambient AWS environment, honoring the
    /// optional endpoint/region overrides.
    pub async fn from_env(endpoint_url: Option<&str>, region: Option<&str>) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        let base = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&base).force_path_style(true);
        if let Some(endpoint) = endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());

        info!(endpoint = ?endpoint_url, "Blob store initialized");
        Ok(Self { client })
    }
}

fn storage_err(op: &str, bucket: &str, key: &str, err: impl std::fmt::Display) -> WorkerError {
    WorkerError::Storage(format!("{} {}/{}: {}", op, bucket, key, err))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(storage_err("head", bucket, key, service_err))
                }
            }
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let page = req
                .send()
                .await
                .map_err(|e| storage_err("list", bucket, prefix, e))?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_err("get", bucket, key, e))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = object.body.into_async_read();
        tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;

        debug!(bucket, key, dest = %dest.display(), "Downloaded object");
        Ok(())
    }

    async fn upload(&self, bucket: &str, key: &str, src: &Path, content_type: &str) -> Result<()> {
        let body = ByteStream::from_path(src)
            .await
            .map_err(|e| storage_err("read", bucket, key, e))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| storage_err("put", bucket, key, e))?;

        debug!(bucket, key, src = %src.display(), "Uploaded object");
        Ok(())
    }

    async fn upload_bytes(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| storage_err("put", bucket, key, e))?;
        Ok(())
    }

    async fn remove(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_err("delete", bucket, key, e))?;
        Ok(())
    }

    async fn remove_batch(&self, bucket: &str, keys: &[String]) -> Result<()> {
        // S3 caps delete-objects at 1000 keys per request.
        for chunk in keys.chunks(1000) {
            let objects: Vec<ObjectIdentifier> = chunk
                .iter()
                .filter_map(|key| ObjectIdentifier::builder().key(key).build().ok())
                .collect();
            if objects.is_empty() {
                continue;
            }
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| storage_err("delete_batch", bucket, "", e))?;
            self.client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| storage_err("delete_batch", bucket, "", e))?;
        }
        Ok(())
    }
}
