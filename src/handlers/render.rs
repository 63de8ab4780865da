//! Clip render handler
//!
//! Renders one clip window to the vertical profile, uploads the video and
//! thumbnail at deterministic keys, and re-evaluates the project: once every
//! clip is terminal, the stage advances to RENDERED.

use tracing::{info, warn};

use crate::blobstore::keys;
use crate::cancel::CancelToken;
use crate::error::{Result, WorkerError};
use crate::media::render_plan;
use crate::media::TranscodeRequest;
use crate::models::payload::decode;
use crate::models::{Clip, ClipRenderPayload, ClipStatus, Job, UsageMetric};
use crate::stage::PipelineStage;
use crate::tempfiles::JobTempDir;

use super::WorkerContext;

pub async fn handle(job: &Job, ctx: &WorkerContext, cancel: &CancelToken) -> Result<()> {
    let payload: ClipRenderPayload = decode(job.kind, &job.payload)?;

    let clip = ctx
        .store
        .get_clip(payload.clip_id)
        .await?
        .ok_or(WorkerError::NotFound {
            entity: "clip",
            id: payload.clip_id.to_string(),
        })?;
    let project = ctx
        .store
        .get_project(clip.project_id)
        .await?
        .ok_or(WorkerError::NotFound {
            entity: "project",
            id: clip.project_id.to_string(),
        })?;

    let render_key = keys::render(clip.workspace_id, clip.project_id, clip.id);

    // Short-circuit: already rendered (object present and row says ready),
    // or the whole project has moved past rendering.
    let already_rendered = clip.status == ClipStatus::Ready
        && clip.storage_path.is_some()
        && ctx.blobs.exists(&ctx.buckets.renders, &render_key).await?;
    if already_rendered || project.pipeline_stage.is_at_least(PipelineStage::Rendered) {
        info!(clip_id = %clip.id, "Clip already rendered, skipping");
        reevaluate_project(ctx, clip.project_id).await?;
        return Ok(());
    }

    ctx.store
        .set_clip_status(clip.id, ClipStatus::Rendering, ctx.clock.now())
        .await?;

    let tmp = JobTempDir::create(&ctx.temp_root, job.id).await?;
    let result = render_clip(&clip, &project.source_path, ctx, &tmp, &render_key, cancel).await;
    tmp.cleanup().await;

    match result {
        Ok(thumb_key) => {
            ctx.store
                .set_clip_rendered(clip.id, &render_key, thumb_key.as_deref(), ctx.clock.now())
                .await?;
            ctx.admission
                .record_usage(job.workspace_id, UsageMetric::Renders, 1)
                .await?;
            info!(clip_id = %clip.id, key = %render_key, "Clip rendered");
            reevaluate_project(ctx, clip.project_id).await?;
            Ok(())
        }
        Err(err) => {
            // Out of retry budget: record the clip as failed so the project
            // can still converge with mixed clip statuses.
            if !err.retryable() || job.attempts >= job.max_attempts {
                warn!(clip_id = %clip.id, error = %err, "Render failed terminally");
                ctx.store
                    .set_clip_status(clip.id, ClipStatus::Failed, ctx.clock.now())
                    .await?;
                reevaluate_project(ctx, clip.project_id).await?;
            }
            Err(err)
        }
    }
}

async fn render_clip(
    clip: &Clip,
    source_path: &Option<String>,
    ctx: &WorkerContext,
    tmp: &JobTempDir,
    render_key: &str,
    cancel: &CancelToken,
) -> Result<Option<String>> {
    let source_key = source_path
        .clone()
        .unwrap_or_else(|| keys::source(clip.workspace_id, clip.project_id, "mp4"));
    let local_source = tmp.file("source.mp4");
    ctx.blobs
        .download(&ctx.buckets.videos, &source_key, &local_source)
        .await?;

    // Subtitles are optional; a missing transcript never fails the render.
    let srt_key = keys::transcript_srt(clip.workspace_id, clip.project_id);
    let local_subs = tmp.file("subs.srt");
    let subtitles = match ctx.blobs.exists(&ctx.buckets.transcripts, &srt_key).await {
        Ok(true) => {
            ctx.blobs
                .download(&ctx.buckets.transcripts, &srt_key, &local_subs)
                .await?;
            Some(local_subs.as_path())
        }
        _ => None,
    };

    cancel.bail_if_cancelled()?;

    let output = tmp.file("render.mp4");
    let args = render_plan::render_args(
        &local_source,
        clip.start_s,
        clip.end_s,
        subtitles,
        &output,
    );
    ctx.transcoder
        .run(
            TranscodeRequest {
                args,
                timeout: ctx.timeouts.render,
                max_duration_seconds: Some(clip.duration_s()),
                output: Some(output.clone()),
            },
            cancel,
        )
        .await?;

    // Thumbnail from the rendered clip's midpoint; failure downgrades to a
    // render without thumb rather than failing the job.
    let thumb = tmp.file("thumb.jpg");
    let thumb_args = render_plan::thumbnail_args(&output, clip.duration_s() / 2.0, &thumb);
    let thumb_key = keys::thumb(clip.workspace_id, clip.project_id, clip.id);
    let thumb_result = ctx
        .transcoder
        .run(
            TranscodeRequest {
                args: thumb_args,
                timeout: ctx.timeouts.thumbnail,
                max_duration_seconds: None,
                output: None,
            },
            cancel,
        )
        .await;

    ctx.blobs
        .upload_if_absent(&ctx.buckets.renders, render_key, &output, "video/mp4")
        .await?;

    let uploaded_thumb = match thumb_result {
        Ok(_) if thumb.exists() => {
            ctx.blobs
                .upload_if_absent(&ctx.buckets.thumbs, &thumb_key, &thumb, "image/jpeg")
                .await?;
            Some(thumb_key)
        }
        Ok(_) => None,
        Err(WorkerError::Cancelled) => return Err(WorkerError::Cancelled),
        Err(err) => {
            warn!(clip_id = %clip.id, error = %err, "Thumbnail generation failed");
            None
        }
    };

    Ok(uploaded_thumb)
}

/// Advances the project to RENDERED once all clips are terminal. The CAS
/// guard makes concurrent render workers converge without extra locking.
async fn reevaluate_project(ctx: &WorkerContext, project_id: uuid::Uuid) -> Result<()> {
    let clips = ctx.store.list_clips(project_id).await?;
    if clips.is_empty() || !clips.iter().all(|c| c.status.is_terminal()) {
        return Ok(());
    }

    let advanced = ctx
        .store
        .advance_stage(project_id, PipelineStage::Rendered, ctx.clock.now())
        .await?;
    if advanced {
        ctx.store
            .set_project_status(
                project_id,
                crate::models::ProjectStatus::Ready,
                None,
                ctx.clock.now(),
            )
            .await?;
        info!(project_id = %project_id, "All clips terminal, project rendered");
    }
    Ok(())
}
