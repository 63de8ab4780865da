//! Standalone thumbnail generation
//!
//! Repair/regeneration path: prefers the rendered clip, falls back to the
//! source video at the clip window's midpoint. Idempotent on an existing
//! thumb.

use tracing::info;

use crate::blobstore::keys;
use crate::cancel::CancelToken;
use crate::error::{Result, WorkerError};
use crate::media::render_plan;
use crate::media::TranscodeRequest;
use crate::models::payload::decode;
use crate::models::{Job, ThumbnailGenPayload};
use crate::tempfiles::JobTempDir;

use super::WorkerContext;

pub async fn handle(job: &Job, ctx: &WorkerContext, cancel: &CancelToken) -> Result<()> {
    let payload: ThumbnailGenPayload = decode(job.kind, &job.payload)?;

    let clip = ctx
        .store
        .get_clip(payload.clip_id)
        .await?
        .ok_or(WorkerError::NotFound {
            entity: "clip",
            id: payload.clip_id.to_string(),
        })?;

    let thumb_key = keys::thumb(clip.workspace_id, clip.project_id, clip.id);
    if clip.thumb_path.is_some() && ctx.blobs.exists(&ctx.buckets.thumbs, &thumb_key).await? {
        info!(clip_id = %clip.id, "Thumbnail already present, skipping");
        return Ok(());
    }

    // Prefer the rendered clip; frame times are then relative to the clip.
    let (bucket, source_key, at_s) = match &clip.storage_path {
        Some(path) => (
            ctx.buckets.renders.clone(),
            path.clone(),
            payload.at_sec.unwrap_or(clip.duration_s() / 2.0),
        ),
        None => (
            ctx.buckets.videos.clone(),
            keys::source(clip.workspace_id, clip.project_id, "mp4"),
            payload.at_sec.unwrap_or_else(|| clip.midpoint_s()),
        ),
    };

    let tmp = JobTempDir::create(&ctx.temp_root, job.id).await?;
    let result: Result<()> = async {
        let local_input = tmp.file("input.mp4");
        ctx.blobs.download(&bucket, &source_key, &local_input).await?;
        cancel.bail_if_cancelled()?;

        let output = tmp.file("thumb.jpg");
        ctx.transcoder
            .run(
                TranscodeRequest {
                    args: render_plan::thumbnail_args(&local_input, at_s, &output),
                    timeout: ctx.timeouts.thumbnail,
                    max_duration_seconds: None,
                    output: None,
                },
                cancel,
            )
            .await?;

        ctx.blobs
            .upload_if_absent(&ctx.buckets.thumbs, &thumb_key, &output, "image/jpeg")
            .await?;
        Ok(())
    }
    .await;

    tmp.cleanup().await;
    result?;

    ctx.store
        .set_clip_thumb(clip.id, &thumb_key, ctx.clock.now())
        .await?;
    info!(clip_id = %clip.id, key = %thumb_key, "Thumbnail generated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::{test_context, TestHarness};
    use crate::models::{ClipStatus, JobKind};
    use crate::stage::PipelineStage;
    use serde_json::json;

    #[tokio::test]
    async fn test_generates_thumb_from_rendered_clip() {
        let harness = TestHarness::new();
        let ctx = test_context(&harness);
        let project = harness.project_at(PipelineStage::Rendered);
        let mut clip = harness.clip(&project, 10.0, 30.0, ClipStatus::Ready);
        let render_key = keys::render(clip.workspace_id, clip.project_id, clip.id);
        clip.storage_path = Some(render_key.clone());
        harness.store.seed_clip(clip.clone());
        harness.blobs.put(&ctx.buckets.renders, &render_key, b"clip".to_vec());

        let job = harness.job(
            JobKind::ThumbnailGen,
            project.workspace_id,
            json!({"clipId": clip.id}),
        );
        handle(&job, &ctx, &CancelToken::never()).await.unwrap();

        let thumb_key = keys::thumb(clip.workspace_id, clip.project_id, clip.id);
        assert!(harness.blobs.get(&ctx.buckets.thumbs, &thumb_key).is_some());
        let after = harness.store.get_clip(clip.id).await.unwrap().unwrap();
        assert_eq!(after.thumb_path.as_deref(), Some(thumb_key.as_str()));
    }

    #[tokio::test]
    async fn test_existing_thumb_short_circuits() {
        let harness = TestHarness::new();
        let ctx = test_context(&harness);
        let project = harness.project_at(PipelineStage::Rendered);
        let mut clip = harness.clip(&project, 10.0, 30.0, ClipStatus::Ready);
        let thumb_key = keys::thumb(clip.workspace_id, clip.project_id, clip.id);
        clip.thumb_path = Some(thumb_key.clone());
        harness.store.seed_clip(clip.clone());
        harness.blobs.put(&ctx.buckets.thumbs, &thumb_key, b"jpg".to_vec());

        let job = harness.job(
            JobKind::ThumbnailGen,
            project.workspace_id,
            json!({"clipId": clip.id}),
        );
        handle(&job, &ctx, &CancelToken::never()).await.unwrap();
        assert_eq!(harness.transcoder.runs(), 0);
    }
}
