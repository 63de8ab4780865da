//! Ingest handler
//!
//! Validates the source URL, pulls the media through the downloader port,
//! and lands it at the deterministic source key. The transcribe job becomes
//! visible only after the source object exists.

use tracing::info;

use crate::blobstore::keys;
use crate::cancel::CancelToken;
use crate::error::{Result, WorkerError};
use crate::media::validate_source_url;
use crate::models::payload::decode;
use crate::models::{IngestUrlPayload, Job, JobKind, ProjectStatus};
use crate::tempfiles::JobTempDir;

use super::WorkerContext;

pub async fn handle(job: &Job, ctx: &WorkerContext, cancel: &CancelToken) -> Result<()> {
    let payload: IngestUrlPayload = decode(job.kind, &job.payload)?;
    let url = validate_source_url(&payload.source_url)?;

    let project = ctx
        .store
        .get_project(payload.project_id)
        .await?
        .ok_or(WorkerError::NotFound {
            entity: "project",
            id: payload.project_id.to_string(),
        })?;
    if project.workspace_id != job.workspace_id {
        return Err(WorkerError::PreconditionFailed(
            "project belongs to a different workspace".into(),
        ));
    }

    let source_key = keys::source(project.workspace_id, project.id, "mp4");

    // Already ingested: make sure the row knows the source, then hand off.
    if ctx.blobs.exists(&ctx.buckets.videos, &source_key).await? {
        info!(project_id = %project.id, key = %source_key, "Source already present, skipping download");
        return finish(job, ctx, &project, &source_key).await;
    }

    let tmp = JobTempDir::create(&ctx.temp_root, job.id).await?;
    let local = tmp.file("source.mp4");

    let result: Result<()> = async {
        ctx.downloader.download(url.as_str(), &local, cancel).await?;
        ctx.blobs
            .upload_if_absent(&ctx.buckets.videos, &source_key, &local, "video/mp4")
            .await?;
        Ok(())
    }
    .await;

    tmp.cleanup().await;
    result?;

    info!(
        project_id = %project.id,
        workspace_id = %project.workspace_id,
        key = %source_key,
        "Source ingested"
    );
    finish(job, ctx, &project, &source_key).await
}

async fn finish(
    job: &Job,
    ctx: &WorkerContext,
    project: &crate::models::Project,
    source_key: &str,
) -> Result<()> {
    let now = ctx.clock.now();

    ctx.store
        .set_project_source(project.id, source_key, now)
        .await?;
    // Only the initial queued -> processing move; replays never demote a
    // project that already progressed.
    if project.status == ProjectStatus::Queued {
        ctx.store
            .set_project_status(project.id, ProjectStatus::Processing, None, now)
            .await?;
    }

    // Successor short-circuits on its own, so re-enqueueing is harmless.
    ctx.queue
        .enqueue(
            JobKind::Transcribe,
            serde_json::json!({ "projectId": project.id }),
            job.workspace_id,
            None,
        )
        .await?;
    Ok(())
}
