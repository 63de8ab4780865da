//! In-memory blob store for tests

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

use super::BlobStore;

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), bytes);
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.objects
            .lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .count()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let bytes = self.get(bucket, key).ok_or(crate::error::WorkerError::Storage(
            format!("object missing: {}/{}", bucket, key),
        ))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }

    async fn upload(&self, bucket: &str, key: &str, src: &Path, _content_type: &str) -> Result<()> {
        let bytes = tokio::fs::read(src).await?;
        self.put(bucket, key, bytes);
        Ok(())
    }

    async fn upload_bytes(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<()> {
        self.put(bucket, key, bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn remove_batch(&self, bucket: &str, keys: &[String]) -> Result<()> {
        let mut objects = self.objects.lock();
        for key in keys {
            objects.remove(&(bucket.to_string(), key.clone()));
        }
        Ok(())
    }
}
