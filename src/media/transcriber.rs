//! Transcription provider port

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{Result, WorkerError};

/// One transcript segment, in source-relative seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub confidence: Option<f64>,
}

/// Parsed transcript artifact, also the persisted JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub segments: Vec<TranscriptSegment>,
    pub duration_sec: f64,
}

#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub srt: String,
    pub transcript: Transcript,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, media: &Path, cancel: &CancelToken) -> Result<TranscriptionResult>;
}

/// HTTP transcription provider client.
pub struct HttpTranscriber {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptionResponse {
    srt: String,
    segments: Vec<TranscriptSegment>,
    duration_sec: f64,
}

impl HttpTranscriber {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, media: &Path, cancel: &CancelToken) -> Result<TranscriptionResult> {
        cancel.bail_if_cancelled()?;

        let bytes = tokio::fs::read(media).await?;
        debug!(
            media = %media.display(),
            bytes = bytes.len(),
            "Submitting media for transcription"
        );

        let file_name = media
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media.mp4".to_string());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let mut request = self
            .client
            .post(format!("{}/v1/transcriptions", self.base_url))
            .multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::select! {
            response = request.send() => response?,
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::from_provider_status(
                "transcriber",
                status.as_u16(),
                body,
            ));
        }

        let parsed: TranscriptionResponse = response.json().await?;
        info!(
            segments = parsed.segments.len(),
            duration_sec = parsed.duration_sec,
            "Transcription complete"
        );
        Ok(TranscriptionResult {
            srt: parsed.srt,
            transcript: Transcript {
                segments: parsed.segments,
                duration_sec: parsed.duration_sec,
            },
        })
    }
}
