//! Source downloader port
//!
//! URL validation plus a yt-dlp wrapper for pulling source videos to a
//! local path. Only known YouTube hosts are accepted at ingest.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use url::Url;

use crate::cancel::CancelToken;
use crate::error::{Result, WorkerError};

const SUPPORTED_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
];

/// Validates an ingest source URL against the supported host patterns.
pub fn validate_source_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| WorkerError::InvalidPayload(format!("source url {:?}: {}", raw, e)))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(WorkerError::InvalidPayload(format!(
            "unsupported url scheme: {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| WorkerError::InvalidPayload("source url has no host".into()))?;
    if !SUPPORTED_HOSTS.contains(&host.to_ascii_lowercase().as_str()) {
        return Err(WorkerError::InvalidPayload(format!(
            "unsupported source host: {}",
            host
        )));
    }
    Ok(url)
}

#[async_trait]
pub trait SourceDownloader: Send + Sync {
    /// Downloads the media at `url` to exactly `dest`.
    async fn download(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<()>;
}

pub struct YtDlpDownloader {
    binary: String,
    timeout: Duration,
}

impl YtDlpDownloader {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SourceDownloader for YtDlpDownloader {
    async fn download(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<()> {
        cancel.bail_if_cancelled()?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(url, dest = %dest.display(), "Starting source download");
        let mut child = Command::new(&self.binary)
            .args([
                "--no-playlist",
                "--no-progress",
                "-f",
                "bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/b",
                "--merge-output-format",
                "mp4",
                "-o",
            ])
            .arg(dest)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(self.timeout) => {
                let _ = child.kill().await;
                return Err(WorkerError::ProviderTransient {
                    platform: Some("downloader".into()),
                    status: None,
                    message: format!("download timed out after {:?}", self.timeout),
                });
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(WorkerError::Cancelled);
            }
        };

        if !status.success() {
            return Err(WorkerError::ProviderTransient {
                platform: Some("downloader".into()),
                status: None,
                message: format!("downloader exited with {:?}", status.code()),
            });
        }
        if !dest.exists() {
            return Err(WorkerError::ProviderTransient {
                platform: Some("downloader".into()),
                status: None,
                message: "downloader produced no output file".into(),
            });
        }
        Ok(())
    }
}
