//! In-memory store backend
//!
//! Mirrors the Postgres backend's semantics (claim exclusivity, conditional
//! stage advance, upsert keys, dedup precision) behind a single mutex so
//! tests exercise the runtime without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Result, WorkerError};
use crate::models::{
    Clip, ClipStatus, ConnectedAccount, Job, JobKind, JobState, NewClip, Platform, Project,
    ProjectStatus, RateLimitBucket, Subscription, UsageDelta, VariantPost, VariantPostStatus,
    WorkspaceUsage,
};
use crate::stage::PipelineStage;

use super::{round_boundary_ms, JobStateCount, Store};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    projects: HashMap<Uuid, Project>,
    clips: HashMap<Uuid, Clip>,
    variant_posts: HashMap<(Uuid, Uuid, Platform), VariantPost>,
    usage: HashMap<(Uuid, DateTime<Utc>), WorkspaceUsage>,
    accounts: HashMap<Uuid, ConnectedAccount>,
    subscriptions: Vec<Subscription>,
    rate_limits: HashMap<(Uuid, String), RateLimitBucket>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- test seeding helpers ----

    pub fn seed_project(&self, project: Project) {
        self.inner.lock().projects.insert(project.id, project);
    }

    pub fn seed_clip(&self, clip: Clip) {
        self.inner.lock().clips.insert(clip.id, clip);
    }

    pub fn seed_account(&self, account: ConnectedAccount) {
        self.inner.lock().accounts.insert(account.id, account);
    }

    pub fn seed_subscription(&self, subscription: Subscription) {
        self.inner.lock().subscriptions.push(subscription);
    }

    pub fn seed_variant_post(&self, post: VariantPost) {
        self.inner.lock().variant_posts.insert(
            (post.clip_id, post.connected_account_id, post.platform),
            post,
        );
    }

    /// Direct job injection for queue tests (bypasses enqueue defaults).
    pub fn seed_job(&self, job: Job) {
        self.inner.lock().jobs.insert(job.id, job);
    }

    pub fn job_snapshot(&self, id: Uuid) -> Option<Job> {
        self.inner.lock().jobs.get(&id).cloned()
    }

    pub fn all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn rate_limit_snapshot(&self, workspace_id: Uuid, feature: &str) -> Option<RateLimitBucket> {
        self.inner
            .lock()
            .rate_limits
            .get(&(workspace_id, feature.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.inner.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn claim_job(
        &self,
        worker_id: &str,
        kinds: Option<&[JobKind]>,
        workspace_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut inner = self.inner.lock();

        let mut eligible: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Queued && j.run_at <= now)
            .filter(|j| kinds.map_or(true, |ks| ks.contains(&j.kind)))
            .filter(|j| workspace_id.map_or(true, |ws| j.workspace_id == ws))
            .collect();
        eligible.sort_by_key(|j| (j.run_at, j.created_at, j.id));

        let Some(id) = eligible.first().map(|j| j.id) else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&id).expect("job exists under lock");
        job.state = JobState::Running;
        job.attempts += 1;
        job.locked_at = Some(now);
        job.locked_by = Some(worker_id.to_string());
        job.heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&id).ok_or(WorkerError::NotFound {
            entity: "job",
            id: id.to_string(),
        })?;
        job.state = JobState::Succeeded;
        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = now;
        Ok(())
    }

    async fn retry_job(
        &self,
        id: Uuid,
        error: &str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&id).ok_or(WorkerError::NotFound {
            entity: "job",
            id: id.to_string(),
        })?;
        job.state = JobState::Queued;
        job.run_at = next_run_at;
        job.last_error = Some(error.to_string());
        job.locked_at = None;
        job.locked_by = None;
        job.heartbeat_at = None;
        job.updated_at = now;
        Ok(())
    }

    async fn dead_letter_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&id).ok_or(WorkerError::NotFound {
            entity: "job",
            id: id.to_string(),
        })?;
        job.state = JobState::DeadLetter;
        job.last_error = Some(error.to_string());
        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = now;
        Ok(())
    }

    async fn heartbeat_job(&self, id: Uuid, worker_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&id) {
            Some(job)
                if job.state == JobState::Running
                    && job.locked_by.as_deref() == Some(worker_id) =>
            {
                job.heartbeat_at = Some(at);
                job.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_stuck_jobs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut recovered = 0u64;
        for job in inner.jobs.values_mut() {
            let stale = job.state == JobState::Running
                && job.heartbeat_at.map_or(true, |hb| hb < stale_before);
            if stale {
                job.state = JobState::Queued;
                job.run_at = now;
                job.locked_at = None;
                job.locked_by = None;
                job.heartbeat_at = None;
                job.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn requeue_dead_letter(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::DeadLetter => {
                job.state = JobState::Queued;
                job.attempts = 0;
                job.run_at = now;
                job.locked_at = None;
                job.locked_by = None;
                job.heartbeat_at = None;
                job.updated_at = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn count_jobs(&self) -> Result<Vec<JobStateCount>> {
        let inner = self.inner.lock();
        let mut counts: HashMap<(JobKind, JobState), i64> = HashMap::new();
        for job in inner.jobs.values() {
            *counts.entry((job.kind, job.state)).or_default() += 1;
        }
        let mut out: Vec<JobStateCount> = counts
            .into_iter()
            .map(|((kind, state), count)| JobStateCount { kind, state, count })
            .collect();
        out.sort_by_key(|c| (c.kind.as_str(), c.state.as_str()));
        Ok(out)
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        Ok(self.inner.lock().projects.get(&id).cloned())
    }

    async fn advance_stage(
        &self,
        project_id: Uuid,
        to: PipelineStage,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.projects.get_mut(&project_id) {
            Some(project) if project.pipeline_stage < to => {
                project.pipeline_stage = to;
                project.updated_at = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn set_project_status(
        &self,
        id: Uuid,
        status: ProjectStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(project) = inner.projects.get_mut(&id) {
            project.status = status;
            if let Some(message) = error_message {
                project.error_message = Some(message.to_string());
            }
            project.updated_at = now;
        }
        Ok(())
    }

    async fn set_project_source(
        &self,
        id: Uuid,
        source_path: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(project) = inner.projects.get_mut(&id) {
            project.source_path = Some(source_path.to_string());
            project.updated_at = now;
        }
        Ok(())
    }

    async fn get_clip(&self, id: Uuid) -> Result<Option<Clip>> {
        Ok(self.inner.lock().clips.get(&id).cloned())
    }

    async fn list_clips(&self, project_id: Uuid) -> Result<Vec<Clip>> {
        let inner = self.inner.lock();
        let mut clips: Vec<Clip> = inner
            .clips
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect();
        clips.sort_by(|a, b| a.start_s.total_cmp(&b.start_s));
        Ok(clips)
    }

    async fn insert_clips(&self, clips: &[NewClip], now: DateTime<Utc>) -> Result<Vec<Clip>> {
        let mut inner = self.inner.lock();
        let mut inserted = Vec::new();

        for candidate in clips {
            let key = (
                round_boundary_ms(candidate.start_s),
                round_boundary_ms(candidate.end_s),
            );
            let duplicate = inner
                .clips
                .values()
                .chain(inserted.iter())
                .filter(|c: &&Clip| c.project_id == candidate.project_id)
                .any(|c| (round_boundary_ms(c.start_s), round_boundary_ms(c.end_s)) == key);
            if duplicate {
                continue;
            }
            let clip = Clip {
                id: Uuid::new_v4(),
                project_id: candidate.project_id,
                workspace_id: candidate.workspace_id,
                start_s: candidate.start_s,
                end_s: candidate.end_s,
                confidence: candidate.confidence,
                title: candidate.title.clone(),
                status: ClipStatus::Proposed,
                storage_path: None,
                thumb_path: None,
                external_id: None,
                keywords_hit: candidate.keywords_hit,
                published_at: None,
                created_at: now,
                updated_at: now,
            };
            inserted.push(clip);
        }

        for clip in &inserted {
            inner.clips.insert(clip.id, clip.clone());
        }
        Ok(inserted)
    }

    async fn set_clip_status(&self, id: Uuid, status: ClipStatus, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(clip) = inner.clips.get_mut(&id) {
            clip.status = status;
            clip.updated_at = now;
        }
        Ok(())
    }

    async fn set_clip_rendered(
        &self,
        id: Uuid,
        storage_path: &str,
        thumb_path: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(clip) = inner.clips.get_mut(&id) {
            clip.status = ClipStatus::Ready;
            clip.storage_path = Some(storage_path.to_string());
            if let Some(thumb) = thumb_path {
                clip.thumb_path = Some(thumb.to_string());
            }
            clip.updated_at = now;
        }
        Ok(())
    }

    async fn set_clip_thumb(&self, id: Uuid, thumb_path: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(clip) = inner.clips.get_mut(&id) {
            clip.thumb_path = Some(thumb_path.to_string());
            clip.updated_at = now;
        }
        Ok(())
    }

    async fn mark_clip_published(
        &self,
        id: Uuid,
        external_id: &str,
        published_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(clip) = inner.clips.get_mut(&id) {
            clip.status = ClipStatus::Published;
            if clip.external_id.is_none() {
                clip.external_id = Some(external_id.to_string());
            }
            if clip.published_at.is_none() {
                clip.published_at = Some(published_at);
            }
            clip.updated_at = published_at;
        }
        Ok(())
    }

    async fn existing_clip_ids(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock();
        Ok(ids
            .iter()
            .copied()
            .filter(|id| inner.clips.contains_key(id))
            .collect())
    }

    async fn list_failed_clips_before(
        &self,
        cutoff: DateTime<Utc>,
        workspace_id: Option<Uuid>,
        project_id: Option<Uuid>,
    ) -> Result<Vec<Clip>> {
        let inner = self.inner.lock();
        Ok(inner
            .clips
            .values()
            .filter(|c| c.status == ClipStatus::Failed && c.updated_at < cutoff)
            .filter(|c| workspace_id.map_or(true, |ws| c.workspace_id == ws))
            .filter(|c| project_id.map_or(true, |p| c.project_id == p))
            .cloned()
            .collect())
    }

    async fn find_variant_post(
        &self,
        clip_id: Uuid,
        connected_account_id: Uuid,
        platform: Platform,
    ) -> Result<Option<VariantPost>> {
        Ok(self
            .inner
            .lock()
            .variant_posts
            .get(&(clip_id, connected_account_id, platform))
            .cloned())
    }

    async fn upsert_variant_post(&self, post: &VariantPost) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = (post.clip_id, post.connected_account_id, post.platform);
        match inner.variant_posts.get_mut(&key) {
            Some(existing) => {
                existing.status = post.status;
                existing.variant_id = post.variant_id.clone();
                existing.platform_post_id = post.platform_post_id.clone();
                existing.posted_at = post.posted_at;
                existing.updated_at = post.updated_at;
            }
            None => {
                inner.variant_posts.insert(key, post.clone());
            }
        }
        Ok(())
    }

    async fn list_recent_posts(
        &self,
        connected_account_id: Uuid,
        platform: Platform,
        since: DateTime<Utc>,
    ) -> Result<Vec<VariantPost>> {
        let inner = self.inner.lock();
        Ok(inner
            .variant_posts
            .values()
            .filter(|p| {
                p.connected_account_id == connected_account_id
                    && p.platform == platform
                    && p.status == VariantPostStatus::Posted
                    && p.posted_at.map_or(false, |at| at >= since)
            })
            .cloned()
            .collect())
    }

    async fn get_connected_account(&self, id: Uuid) -> Result<Option<ConnectedAccount>> {
        Ok(self.inner.lock().accounts.get(&id).cloned())
    }

    async fn update_account_tokens(
        &self,
        id: Uuid,
        access_token_ref: &str,
        refresh_token_ref: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(account) = inner.accounts.get_mut(&id) {
            account.access_token_ref = access_token_ref.to_string();
            if let Some(refresh) = refresh_token_ref {
                account.refresh_token_ref = Some(refresh.to_string());
            }
            account.expires_at = expires_at;
        }
        Ok(())
    }

    async fn get_open_usage(
        &self,
        workspace_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> Result<WorkspaceUsage> {
        let mut inner = self.inner.lock();
        let usage = inner
            .usage
            .entry((workspace_id, period_start))
            .or_insert_with(|| WorkspaceUsage::open(workspace_id, period_start));
        Ok(usage.clone())
    }

    async fn increment_usage(
        &self,
        workspace_id: Uuid,
        period_start: DateTime<Utc>,
        delta: UsageDelta,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let usage = inner
            .usage
            .entry((workspace_id, period_start))
            .or_insert_with(|| WorkspaceUsage::open(workspace_id, period_start));
        usage.clips_count += delta.clips;
        usage.source_minutes += delta.source_minutes;
        usage.posts += delta.posts;
        usage.renders += delta.renders;
        usage.updated_at = now;
        Ok(())
    }

    async fn list_subscriptions(&self, workspace_id: Uuid) -> Result<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn list_current_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.is_current())
            .cloned()
            .collect())
    }

    async fn upsert_rate_limit(&self, bucket: &RateLimitBucket) -> Result<()> {
        self.inner
            .lock()
            .rate_limits
            .insert((bucket.workspace_id, bucket.feature.clone()), bucket.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
