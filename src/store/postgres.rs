//! Postgres store backend
//!
//! Runtime-checked sqlx queries; one transaction per call. Claims rely on
//! `FOR UPDATE SKIP LOCKED`, stage advances and DLQ requeues on conditional
//! `UPDATE ... WHERE` guards, and variant-post/usage writes on `ON CONFLICT`
//! upserts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, WorkerError};
use crate::models::{
    Clip, ClipStatus, ConnectedAccount, Job, JobKind, JobState, NewClip, Platform, Project,
    ProjectStatus, RateLimitBucket, Subscription, UsageDelta, VariantPost, WorkspaceUsage,
};
use crate::stage::PipelineStage;

use super::{round_boundary_ms, JobStateCount, Store};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects to the database and runs pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| WorkerError::Internal(format!("migration failed: {}", e)))?;

        info!("Database ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, workspace_id, kind, payload, state, attempts, max_attempts,
                 run_at, locked_at, locked_by, heartbeat_at, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id)
        .bind(job.workspace_id)
        .bind(job.kind)
        .bind(&job.payload)
        .bind(job.state)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.run_at)
        .bind(job.locked_at)
        .bind(&job.locked_by)
        .bind(job.heartbeat_at)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn claim_job(
        &self,
        worker_id: &str,
        kinds: Option<&[JobKind]>,
        workspace_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let kind_names: Option<Vec<String>> =
            kinds.map(|ks| ks.iter().map(|k| k.as_str().to_string()).collect());

        // Single statement: the inner SELECT takes the row lock (skipping
        // rows other workers hold), the UPDATE flips it to running.
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET
                state = 'running',
                attempts = attempts + 1,
                locked_at = $2,
                locked_by = $1,
                heartbeat_at = $2,
                updated_at = $2
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'queued'
                  AND run_at <= $2
                  AND ($3::uuid IS NULL OR workspace_id = $3)
                  AND ($4::text[] IS NULL OR kind::text = ANY($4))
                ORDER BY run_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(workspace_id)
        .bind(kind_names)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn complete_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'succeeded',
                locked_at = NULL,
                locked_by = NULL,
                updated_at = $2
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry_job(
        &self,
        id: Uuid,
        error: &str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'queued',
                run_at = $3,
                last_error = $2,
                locked_at = NULL,
                locked_by = NULL,
                heartbeat_at = NULL,
                updated_at = $4
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_run_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_letter_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'dead_letter',
                last_error = $2,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = $3
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat_job(&self, id: Uuid, worker_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET heartbeat_at = $3, updated_at = $3
            WHERE id = $1 AND state = 'running' AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn recover_stuck_jobs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'queued',
                run_at = $2,
                locked_at = NULL,
                locked_by = NULL,
                heartbeat_at = NULL,
                updated_at = $2
            WHERE state = 'running'
              AND (heartbeat_at IS NULL OR heartbeat_at < $1)
            "#,
        )
        .bind(stale_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn requeue_dead_letter(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        // Conditional on the current state so concurrent requeues race safely.
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'queued',
                attempts = 0,
                run_at = $2,
                locked_at = NULL,
                locked_by = NULL,
                heartbeat_at = NULL,
                updated_at = $2
            WHERE id = $1 AND state = 'dead_letter'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_jobs(&self) -> Result<Vec<JobStateCount>> {
        let rows: Vec<(JobKind, JobState, i64)> = sqlx::query_as(
            "SELECT kind, state, COUNT(*) FROM jobs GROUP BY kind, state ORDER BY kind, state",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(kind, state, count)| JobStateCount { kind, state, count })
            .collect())
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(project)
    }

    async fn advance_stage(
        &self,
        project_id: Uuid,
        to: PipelineStage,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        // The enum's declaration order is the pipeline order, so `<`
        // compares stages correctly and rejects regressions.
        let result = sqlx::query(
            r#"
            UPDATE projects SET pipeline_stage = $2, updated_at = $3
            WHERE id = $1 AND pipeline_stage < $2
            "#,
        )
        .bind(project_id)
        .bind(to)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_project_status(
        &self,
        id: Uuid,
        status: ProjectStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE projects SET
                status = $2,
                error_message = COALESCE($3, error_message),
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error_message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_project_source(
        &self,
        id: Uuid,
        source_path: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE projects SET source_path = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(source_path)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_clip(&self, id: Uuid) -> Result<Option<Clip>> {
        let clip = sqlx::query_as::<_, Clip>("SELECT * FROM clips WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(clip)
    }

    async fn list_clips(&self, project_id: Uuid) -> Result<Vec<Clip>> {
        let clips = sqlx::query_as::<_, Clip>(
            "SELECT * FROM clips WHERE project_id = $1 ORDER BY start_s ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(clips)
    }

    async fn insert_clips(&self, clips: &[NewClip], now: DateTime<Utc>) -> Result<Vec<Clip>> {
        if clips.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        // Application-level dedup at 3-decimal precision against the rows
        // already present for the project.
        let project_id = clips[0].project_id;
        let existing: Vec<(f64, f64)> =
            sqlx::query_as("SELECT start_s, end_s FROM clips WHERE project_id = $1 FOR UPDATE")
                .bind(project_id)
                .fetch_all(&mut *tx)
                .await?;
        let mut seen: std::collections::HashSet<(i64, i64)> = existing
            .iter()
            .map(|(s, e)| (round_boundary_ms(*s), round_boundary_ms(*e)))
            .collect();

        let mut inserted = Vec::new();
        for candidate in clips {
            let key = (
                round_boundary_ms(candidate.start_s),
                round_boundary_ms(candidate.end_s),
            );
            if !seen.insert(key) {
                continue;
            }
            let clip = sqlx::query_as::<_, Clip>(
                r#"
                INSERT INTO clips
                    (id, project_id, workspace_id, start_s, end_s, confidence, title,
                     status, keywords_hit, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 'proposed', $8, $9, $9)
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(candidate.project_id)
            .bind(candidate.workspace_id)
            .bind(candidate.start_s)
            .bind(candidate.end_s)
            .bind(candidate.confidence)
            .bind(&candidate.title)
            .bind(candidate.keywords_hit)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            inserted.push(clip);
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn set_clip_status(&self, id: Uuid, status: ClipStatus, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE clips SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_clip_rendered(
        &self,
        id: Uuid,
        storage_path: &str,
        thumb_path: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE clips SET
                status = 'ready',
                storage_path = $2,
                thumb_path = COALESCE($3, thumb_path),
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(storage_path)
        .bind(thumb_path)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_clip_thumb(&self, id: Uuid, thumb_path: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE clips SET thumb_path = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(thumb_path)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_clip_published(
        &self,
        id: Uuid,
        external_id: &str,
        published_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE clips SET
                status = 'published',
                external_id = COALESCE(external_id, $2),
                published_at = COALESCE(published_at, $3),
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(external_id)
        .bind(published_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn existing_clip_ids(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM clips WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn list_failed_clips_before(
        &self,
        cutoff: DateTime<Utc>,
        workspace_id: Option<Uuid>,
        project_id: Option<Uuid>,
    ) -> Result<Vec<Clip>> {
        let clips = sqlx::query_as::<_, Clip>(
            r#"
            SELECT * FROM clips
            WHERE status = 'failed'
              AND updated_at < $1
              AND ($2::uuid IS NULL OR workspace_id = $2)
              AND ($3::uuid IS NULL OR project_id = $3)
            "#,
        )
        .bind(cutoff)
        .bind(workspace_id)
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(clips)
    }

    async fn find_variant_post(
        &self,
        clip_id: Uuid,
        connected_account_id: Uuid,
        platform: Platform,
    ) -> Result<Option<VariantPost>> {
        let post = sqlx::query_as::<_, VariantPost>(
            r#"
            SELECT * FROM variant_posts
            WHERE clip_id = $1 AND connected_account_id = $2 AND platform = $3
            "#,
        )
        .bind(clip_id)
        .bind(connected_account_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await?;
        Ok(post)
    }

    async fn upsert_variant_post(&self, post: &VariantPost) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO variant_posts
                (id, clip_id, connected_account_id, platform, variant_id,
                 status, platform_post_id, posted_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (clip_id, connected_account_id, platform) DO UPDATE SET
                variant_id = EXCLUDED.variant_id,
                status = EXCLUDED.status,
                platform_post_id = EXCLUDED.platform_post_id,
                posted_at = EXCLUDED.posted_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(post.id)
        .bind(post.clip_id)
        .bind(post.connected_account_id)
        .bind(post.platform)
        .bind(&post.variant_id)
        .bind(post.status)
        .bind(&post.platform_post_id)
        .bind(post.posted_at)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_recent_posts(
        &self,
        connected_account_id: Uuid,
        platform: Platform,
        since: DateTime<Utc>,
    ) -> Result<Vec<VariantPost>> {
        let posts = sqlx::query_as::<_, VariantPost>(
            r#"
            SELECT * FROM variant_posts
            WHERE connected_account_id = $1
              AND platform = $2
              AND status = 'posted'
              AND posted_at >= $3
            ORDER BY posted_at DESC
            "#,
        )
        .bind(connected_account_id)
        .bind(platform)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    async fn get_connected_account(&self, id: Uuid) -> Result<Option<ConnectedAccount>> {
        let account =
            sqlx::query_as::<_, ConnectedAccount>("SELECT * FROM connected_accounts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(account)
    }

    async fn update_account_tokens(
        &self,
        id: Uuid,
        access_token_ref: &str,
        refresh_token_ref: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE connected_accounts SET
                access_token_ref = $2,
                refresh_token_ref = COALESCE($3, refresh_token_ref),
                expires_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(access_token_ref)
        .bind(refresh_token_ref)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_open_usage(
        &self,
        workspace_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> Result<WorkspaceUsage> {
        let usage = sqlx::query_as::<_, WorkspaceUsage>(
            r#"
            INSERT INTO workspace_usage
                (workspace_id, period_start, clips_count, source_minutes, posts, renders, updated_at)
            VALUES ($1, $2, 0, 0, 0, 0, $2)
            ON CONFLICT (workspace_id, period_start) DO UPDATE SET
                workspace_id = EXCLUDED.workspace_id
            RETURNING *
            "#,
        )
        .bind(workspace_id)
        .bind(period_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(usage)
    }

    async fn increment_usage(
        &self,
        workspace_id: Uuid,
        period_start: DateTime<Utc>,
        delta: UsageDelta,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workspace_usage
                (workspace_id, period_start, clips_count, source_minutes, posts, renders, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (workspace_id, period_start) DO UPDATE SET
                clips_count = workspace_usage.clips_count + EXCLUDED.clips_count,
                source_minutes = workspace_usage.source_minutes + EXCLUDED.source_minutes,
                posts = workspace_usage.posts + EXCLUDED.posts,
                renders = workspace_usage.renders + EXCLUDED.renders,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(workspace_id)
        .bind(period_start)
        .bind(delta.clips)
        .bind(delta.source_minutes)
        .bind(delta.posts)
        .bind(delta.renders)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_subscriptions(&self, workspace_id: Uuid) -> Result<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE workspace_id = $1",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn list_current_subscriptions(&self) -> Result<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE status IN ('active', 'trialing')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn upsert_rate_limit(&self, bucket: &RateLimitBucket) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limits
                (workspace_id, feature, capacity, refill_rate, tokens, last_refill_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workspace_id, feature) DO UPDATE SET
                capacity = EXCLUDED.capacity,
                refill_rate = EXCLUDED.refill_rate,
                tokens = LEAST(rate_limits.tokens, EXCLUDED.capacity::double precision)
            "#,
        )
        .bind(bucket.workspace_id)
        .bind(&bucket.feature)
        .bind(bucket.capacity)
        .bind(bucket.refill_rate)
        .bind(bucket.tokens)
        .bind(bucket.last_refill_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
