//! Clip rows: derived segments of a project

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "clip_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClipStatus {
    Proposed,
    Rendering,
    Ready,
    Failed,
    Published,
}

impl ClipStatus {
    /// Terminal from the project's point of view: nothing further will run
    /// for this clip without an explicit new job.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClipStatus::Ready | ClipStatus::Failed | ClipStatus::Published
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClipStatus::Proposed => "proposed",
            ClipStatus::Rendering => "rendering",
            ClipStatus::Ready => "ready",
            ClipStatus::Failed => "failed",
            ClipStatus::Published => "published",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Clip {
    pub id: Uuid,
    pub project_id: Uuid,
    pub workspace_id: Uuid,
    pub start_s: f64,
    pub end_s: f64,
    pub confidence: f64,
    pub title: String,
    pub status: ClipStatus,
    pub storage_path: Option<String>,
    pub thumb_path: Option<String>,
    /// Legacy single-target publish id; read-only fallback, never written by
    /// new publish paths beyond the one-time set on first publish.
    pub external_id: Option<String>,
    pub keywords_hit: i32,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Clip {
    pub fn duration_s(&self) -> f64 {
        self.end_s - self.start_s
    }

    /// Half-open interval overlap on `[start_s, end_s)`.
    pub fn overlaps(&self, start_s: f64, end_s: f64) -> bool {
        self.start_s < end_s && start_s < self.end_s
    }

    /// Midpoint of the clip window, used for thumbnail extraction.
    pub fn midpoint_s(&self) -> f64 {
        self.start_s + self.duration_s() / 2.0
    }
}

/// Insert candidate produced by highlight detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewClip {
    pub project_id: Uuid,
    pub workspace_id: Uuid,
    pub start_s: f64,
    pub end_s: f64,
    pub confidence: f64,
    pub title: String,
    pub keywords_hit: i32,
}

impl NewClip {
    pub fn duration_s(&self) -> f64 {
        self.end_s - self.start_s
    }
}
