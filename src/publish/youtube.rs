//! YouTube publisher
//!
//! Resumable upload: a metadata POST yields the session URL, the binary PUT
//! completes it and returns the video id.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{Result, WorkerError};
use crate::models::Platform;

use super::{retry_after_ms, AccessToken, PostSpec, Publisher};

pub struct YouTubePublisher {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct UploadedVideo {
    id: String,
}

impl YouTubePublisher {
    pub fn new(base_url: impl Into<String>, upload_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(upload_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn classify(&self, response: reqwest::Response) -> WorkerError {
        let status = response.status().as_u16();
        let retry_ms = retry_after_ms(&response);
        let body = response.text().await.unwrap_or_default();
        match WorkerError::from_provider_status("youtube", status, body) {
            WorkerError::ProviderRateLimited {
                platform, status, ..
            } => WorkerError::ProviderRateLimited {
                platform,
                status,
                retry_after_ms: retry_ms,
            },
            other => other,
        }
    }
}

#[async_trait]
impl Publisher for YouTubePublisher {
    fn platform(&self) -> Platform {
        Platform::Youtube
    }

    async fn upload(
        &self,
        token: &AccessToken,
        file: &Path,
        spec: &PostSpec,
        cancel: &CancelToken,
    ) -> Result<String> {
        cancel.bail_if_cancelled()?;

        let metadata = json!({
            "snippet": {
                "title": spec.title.clone().unwrap_or_else(|| "Untitled clip".to_string()),
                "description": spec.description.clone().unwrap_or_default(),
                "tags": spec.tags,
            },
            "status": {
                "privacyStatus": spec.visibility.clone().unwrap_or_else(|| "private".to_string()),
            }
        });

        // Step 1: open the resumable session.
        let response = tokio::select! {
            r = self
                .client
                .post(format!(
                    "{}/upload/youtube/v3/videos?uploadType=resumable&part=snippet,status",
                    self.base_url
                ))
                .bearer_auth(&token.token)
                .json(&metadata)
                .send() => r?,
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
        };
        if !response.status().is_success() {
            return Err(self.classify(response).await);
        }
        let upload_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| WorkerError::ProviderTransient {
                platform: Some("youtube".into()),
                status: None,
                message: "resumable session missing Location header".into(),
            })?;
        debug!(upload_url = %upload_url, "YouTube resumable session opened");

        // Step 2: upload the bytes.
        let bytes = tokio::fs::read(file).await?;
        let response = tokio::select! {
            r = self
                .client
                .put(&upload_url)
                .bearer_auth(&token.token)
                .header(reqwest::header::CONTENT_TYPE, "video/mp4")
                .body(bytes)
                .send() => r?,
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
        };
        if !response.status().is_success() {
            return Err(self.classify(response).await);
        }

        let video: UploadedVideo = response.json().await?;
        info!(video_id = %video.id, "YouTube upload complete");
        Ok(video.id)
    }
}
