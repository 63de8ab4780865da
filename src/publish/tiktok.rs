//! TikTok publisher
//!
//! Three-step direct-post flow: init (declares size and post info), binary
//! upload to the returned URL, then a status confirmation. The publish id
//! from init is the recorded platform post id.

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

pub struct TikTokPublisher {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    data: InitData,
}

#[derive(Debug, Deserialize)]
struct InitData {
    publish_id: String,
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    data: StatusData,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    status: String,
    #[serde(default)]
    fail_reason: Option<String>,
}

impl TikTokPublisher {
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
        match WorkerError::from_provider_status("tiktok", status, body) {
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
impl Publisher for TikTokPublisher {
    fn platform(&self) -> Platform {
        Platform::Tiktok
    }

    async fn upload(
        &self,
        token: &AccessToken,
        file: &Path,
        spec: &PostSpec,
        cancel: &CancelToken,
    ) -> Result<String> {
        cancel.bail_if_cancelled()?;

        let bytes = tokio::fs::read(file).await?;
        let size = bytes.len() as u64;

        // Step 1: init declares the post and the upload shape (one chunk).
        let init_body = json!({
            "post_info": {
                "title": spec.caption.clone().or_else(|| spec.title.clone()).unwrap_or_default(),
                "privacy_level": spec.privacy_level.clone().unwrap_or_else(|| "SELF_ONLY".to_string()),
            },
            "source_info": {
                "source": "FILE_UPLOAD",
                "video_size": size,
                "chunk_size": size,
                "total_chunk_count": 1,
            }
        });

        let response = tokio::select! {
            r = self
                .client
                .post(format!("{}/v2/post/publish/video/init/", self.base_url))
                .bearer_auth(&token.token)
                .json(&init_body)
                .send() => r?,
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
        };
        if !response.status().is_success() {
            return Err(self.classify(response).await);
        }
        let init: InitResponse = response.json().await?;
        debug!(publish_id = %init.data.publish_id, "TikTok upload initialized");

        // Step 2: single-chunk binary upload.
        let range = format!("bytes 0-{}/{}", size.saturating_sub(1), size);
        let response = tokio::select! {
            r = self
                .client
                .put(&init.data.upload_url)
                .header(reqwest::header::CONTENT_TYPE, "video/mp4")
                .header(reqwest::header::CONTENT_RANGE, range)
                .body(bytes)
                .send() => r?,
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
        };
        if !response.status().is_success() {
            return Err(self.classify(response).await);
        }

        // Step 3: confirm the publish was accepted.
        let response = tokio::select! {
            r = self
                .client
                .post(format!("{}/v2/post/publish/status/fetch/", self.base_url))
                .bearer_auth(&token.token)
                .json(&json!({"publish_id": init.data.publish_id}))
                .send() => r?,
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
        };
        if !response.status().is_success() {
            return Err(self.classify(response).await);
        }
        let status: StatusResponse = response.json().await?;
        if status.data.status == "FAILED" {
            return Err(WorkerError::ProviderTransient {
                platform: Some("tiktok".into()),
                status: None,
                message: status
                    .data
                    .fail_reason
                    .unwrap_or_else(|| "publish failed".into()),
            });
        }

        info!(publish_id = %init.data.publish_id, "TikTok publish accepted");
        Ok(init.data.publish_id)
    }
}
