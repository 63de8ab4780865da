//! Scoped temp directories
//!
//! Every handler gets a private directory under the configured temp root,
//! removed on all exit paths. Deletion refuses suspicious targets (`/`,
//! `.`, empty paths, anything outside the temp root).

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

/// Refuses paths that must never be recursively deleted.
pub fn is_safe_to_remove(root: &Path, target: &Path) -> bool {
    let raw = target.as_os_str();
    if raw.is_empty() {
        return false;
    }
    if target == Path::new("/") || target == Path::new(".") || target == Path::new("..") {
        return false;
    }
    // Only paths strictly inside the temp root qualify.
    target.starts_with(root) && target != root
}

/// A job-scoped working directory.
pub struct JobTempDir {
    root: PathBuf,
    path: PathBuf,
}

impl JobTempDir {
    pub async fn create(root: &Path, job_id: Uuid) -> Result<Self> {
        let path = root.join(job_id.to_string());
        tokio::fs::create_dir_all(&path).await?;
        debug!(path = %path.display(), "Created job temp dir");
        Ok(Self {
            root: root.to_path_buf(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Removes the directory, logging rather than failing the job.
    pub async fn cleanup(mut self) {
        // Taking the path disarms the Drop fallback (empty paths are never
        // removable).
        let path = std::mem::take(&mut self.path);
        if !is_safe_to_remove(&self.root, &path) {
            warn!(path = %path.display(), "Refusing to remove unsafe temp path");
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Temp dir cleanup failed");
            }
        }
    }
}

impl Drop for JobTempDir {
    fn drop(&mut self) {
        // Fallback for early-return paths that skipped explicit cleanup.
        if !is_safe_to_remove(&self.root, &self.path) {
            return;
        }
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            // Recursive deletion can be slow; keep it off the async worker
            // threads. Fire-and-forget is fine for a best-effort fallback.
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    let _ = std::fs::remove_dir_all(&path);
                });
            }
            // No runtime (process teardown): blocking here is harmless.
            Err(_) => {
                let _ = std::fs::remove_dir_all(&path);
            }
        }
    }
}
