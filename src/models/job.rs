//! Job rows: the durable unit of work

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kinds of work the pipeline knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_kind", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    IngestUrl,
    Transcribe,
    HighlightDetect,
    ClipRender,
    ThumbnailGen,
    PublishTiktok,
    PublishYoutube,
    CleanupStorage,
}

impl JobKind {
    pub const ALL: &'static [JobKind] = &[
        JobKind::IngestUrl,
        JobKind::Transcribe,
        JobKind::HighlightDetect,
        JobKind::ClipRender,
        JobKind::ThumbnailGen,
        JobKind::PublishTiktok,
        JobKind::PublishYoutube,
        JobKind::CleanupStorage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::IngestUrl => "INGEST_URL",
            JobKind::Transcribe => "TRANSCRIBE",
            JobKind::HighlightDetect => "HIGHLIGHT_DETECT",
            JobKind::ClipRender => "CLIP_RENDER",
            JobKind::ThumbnailGen => "THUMBNAIL_GEN",
            JobKind::PublishTiktok => "PUBLISH_TIKTOK",
            JobKind::PublishYoutube => "PUBLISH_YOUTUBE",
            JobKind::CleanupStorage => "CLEANUP_STORAGE",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle states.
///
/// Transitions only along `queued -> running -> {succeeded | queued (retry) |
/// dead_letter}`; `failed` is a transient marker never observable across a
/// store call boundary. Terminal states are `succeeded` and `dead_letter`;
/// only admin requeue leaves `dead_letter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    DeadLetter,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::DeadLetter)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts: i32,
    pub max_attempts: i32,
    /// Earliest eligible execution time.
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Default retry budget per job.
    pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

    /// Builds a fresh queued job ready for insertion.
    pub fn enqueue(
        workspace_id: Uuid,
        kind: JobKind,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
    ) -> Self {
        let now = run_at;
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            kind,
            payload,
            state: JobState::Queued,
            attempts: 0,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            run_at,
            locked_at: None,
            locked_by: None,
            heartbeat_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the retry budget still has room for another attempt.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
