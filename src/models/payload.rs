//! Per-kind job payloads
//!
//! Each handler decodes its payload against one of these schemas before
//! doing any work. Decode or validation failure is a non-retryable
//! `InvalidPayload`; in particular, non-UUID ids never get past this point.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::{Result, WorkerError};
use crate::models::job::JobKind;

/// Decodes and validates a payload value for the given kind.
pub fn decode<T>(kind: JobKind, payload: &serde_json::Value) -> Result<T>
where
    T: DeserializeOwned + Validate,
{
    let parsed: T = serde_json::from_value(payload.clone())
        .map_err(|e| WorkerError::InvalidPayload(format!("{} payload: {}", kind, e)))?;
    parsed
        .validate()
        .map_err(|e| WorkerError::InvalidPayload(format!("{} payload: {}", kind, e)))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngestUrlPayload {
    pub project_id: Uuid,
    #[validate(url)]
    pub source_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TranscribePayload {
    pub project_id: Uuid,
    pub source_ext: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HighlightDetectPayload {
    pub project_id: Uuid,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[validate(range(min = 0.0))]
    pub min_gap_sec: f64,
    /// Requested clip-count override; fractional values are floored,
    /// non-positive or non-finite values are ignored downstream.
    pub max_clips: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClipRenderPayload {
    pub clip_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ThumbnailGenPayload {
    pub clip_id: Uuid,
    #[validate(range(min = 0.0))]
    pub at_sec: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PublishTiktokPayload {
    pub clip_id: Uuid,
    pub connected_account_id: Uuid,
    #[validate(length(max = 2200))]
    pub caption: Option<String>,
    pub privacy_level: Option<String>,
    pub experiment_id: Option<String>,
    pub variant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PublishYoutubePayload {
    pub clip_id: Uuid,
    pub connected_account_id: Uuid,
    #[validate(length(max = 100))]
    pub title: Option<String>,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub visibility: Option<String>,
    pub experiment_id: Option<String>,
    pub variant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CleanupStoragePayload {
    pub workspace_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub retention_days: Option<i64>,
}
