//! Store port
//!
//! Narrow, intention-revealing operations over the relational tables the
//! runtime owns. Each mutation is transactional per call; callers never see
//! partially applied writes. Production uses Postgres, tests use the
//! in-memory backend.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Clip, ClipStatus, ConnectedAccount, Job, JobKind, JobState, NewClip, Platform, Project,
    ProjectStatus, RateLimitBucket, Subscription, UsageDelta, VariantPost, WorkspaceUsage,
};
use crate::stage::PipelineStage;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Per-(kind, state) job counts for the status surface.
#[derive(Debug, Clone)]
pub struct JobStateCount {
    pub kind: JobKind,
    pub state: JobState,
    pub count: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ---- jobs ----

    async fn insert_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// Atomically claims one eligible queued job for `worker_id`.
    ///
    /// Eligible means `state = queued`, `run_at <= now`, and matching the
    /// optional kind/workspace filters. The claimed row moves to `running`
    /// with `attempts` incremented and lock columns set. Returns `None`
    /// when nothing is eligible. Ordering is FIFO with delay: `run_at`
    /// ascending, then `created_at` ascending.
    async fn claim_job(
        &self,
        worker_id: &str,
        kinds: Option<&[JobKind]>,
        workspace_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    async fn complete_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Reschedules a failed-but-retryable job back to `queued`.
    /// `attempts` is left as claimed; it is never reset on normal retry.
    async fn retry_job(
        &self,
        id: Uuid,
        error: &str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn dead_letter_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()>;

    /// Refreshes `heartbeat_at` while the job is still running and owned by
    /// `worker_id`. Returns false when the job is no longer ours, so the
    /// heartbeat pump can stop.
    async fn heartbeat_job(&self, id: Uuid, worker_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Requeues running jobs whose heartbeat went silent before
    /// `stale_before`. Returns the number of jobs recovered. This is the
    /// only path that mutates a running job from outside its owning worker.
    async fn recover_stuck_jobs(&self, stale_before: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<u64>;

    /// Conditionally requeues a dead-letter job with a fresh attempt budget.
    /// Returns false when the job was not in `dead_letter` (lost race or
    /// wrong id), leaving the row untouched.
    async fn requeue_dead_letter(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    async fn count_jobs(&self) -> Result<Vec<JobStateCount>>;

    // ---- projects ----

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>>;

    /// Compare-and-set stage advance: succeeds only while the project's
    /// current stage is strictly below `to`. Returns whether a row changed.
    async fn advance_stage(&self, project_id: Uuid, to: PipelineStage, now: DateTime<Utc>)
        -> Result<bool>;

    async fn set_project_status(
        &self,
        id: Uuid,
        status: ProjectStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_project_source(&self, id: Uuid, source_path: &str, now: DateTime<Utc>)
        -> Result<()>;

    // ---- clips ----

    async fn get_clip(&self, id: Uuid) -> Result<Option<Clip>>;

    async fn list_clips(&self, project_id: Uuid) -> Result<Vec<Clip>>;

    /// Inserts candidates atomically, deduping against existing rows on
    /// `(start_s, end_s)` at 3-decimal precision. Returns the rows actually
    /// inserted.
    async fn insert_clips(&self, clips: &[NewClip], now: DateTime<Utc>) -> Result<Vec<Clip>>;

    async fn set_clip_status(&self, id: Uuid, status: ClipStatus, now: DateTime<Utc>)
        -> Result<()>;

    /// Marks a clip rendered with its artifact paths.
    async fn set_clip_rendered(
        &self,
        id: Uuid,
        storage_path: &str,
        thumb_path: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_clip_thumb(&self, id: Uuid, thumb_path: &str, now: DateTime<Utc>) -> Result<()>;

    /// Marks a clip published, setting `external_id`/`published_at` only if
    /// not already set.
    async fn mark_clip_published(
        &self,
        id: Uuid,
        external_id: &str,
        published_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Filters the given ids down to those that still exist.
    async fn existing_clip_ids(&self, ids: &[Uuid]) -> Result<Vec<Uuid>>;

    /// Failed clips last touched before `cutoff`, optionally scoped.
    async fn list_failed_clips_before(
        &self,
        cutoff: DateTime<Utc>,
        workspace_id: Option<Uuid>,
        project_id: Option<Uuid>,
    ) -> Result<Vec<Clip>>;

    // ---- variant posts ----

    async fn find_variant_post(
        &self,
        clip_id: Uuid,
        connected_account_id: Uuid,
        platform: Platform,
    ) -> Result<Option<VariantPost>>;

    /// Upserts on `(clip_id, connected_account_id, platform)`.
    async fn upsert_variant_post(&self, post: &VariantPost) -> Result<()>;

    /// Posted variant-posts for an account/platform since `since`.
    async fn list_recent_posts(
        &self,
        connected_account_id: Uuid,
        platform: Platform,
        since: DateTime<Utc>,
    ) -> Result<Vec<VariantPost>>;

    // ---- connected accounts ----

    async fn get_connected_account(&self, id: Uuid) -> Result<Option<ConnectedAccount>>;

    async fn update_account_tokens(
        &self,
        id: Uuid,
        access_token_ref: &str,
        refresh_token_ref: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    // ---- usage ----

    /// Reads the open usage row for the month, creating a zeroed one if
    /// missing.
    async fn get_open_usage(
        &self,
        workspace_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> Result<WorkspaceUsage>;

    /// Atomic counter increment on the open usage row.
    async fn increment_usage(
        &self,
        workspace_id: Uuid,
        period_start: DateTime<Utc>,
        delta: UsageDelta,
        now: DateTime<Utc>,
    ) -> Result<()>;

    // ---- subscriptions & rate limits ----

    async fn list_subscriptions(&self, workspace_id: Uuid) -> Result<Vec<Subscription>>;

    /// All current (active/trialing) subscriptions, for rate-limit seeding.
    async fn list_current_subscriptions(&self) -> Result<Vec<Subscription>>;

    async fn upsert_rate_limit(&self, bucket: &RateLimitBucket) -> Result<()>;

    // ---- health ----

    /// Cheap connectivity probe for readiness checks.
    async fn ping(&self) -> Result<()>;
}

/// Rounds a clip boundary to the 3-decimal dedup precision.
pub(crate) fn round_boundary_ms(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_boundary_precision() {
        assert_eq!(round_boundary_ms(1.2344), 1234);
        assert_eq!(round_boundary_ms(1.2345), 1235);
        assert_eq!(round_boundary_ms(0.0), 0);
    }
}
