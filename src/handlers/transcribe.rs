//! Transcribe handler
//!
//! Usage-guarded transcription of the project source. Artifacts land at
//! deterministic transcript keys with create-if-absent semantics, so a
//! replay re-uploads nothing.

use tracing::info;

use crate::blobstore::keys;
use crate::cancel::CancelToken;
use crate::error::{Result, WorkerError};
use crate::models::payload::decode;
use crate::models::{Job, JobKind, TranscribePayload, UsageMetric};
use crate::stage::PipelineStage;
use crate::tempfiles::JobTempDir;

use super::WorkerContext;

/// Default segment-gap threshold handed to highlight detection.
const DEFAULT_MIN_GAP_SEC: f64 = 2.0;

pub async fn handle(job: &Job, ctx: &WorkerContext, cancel: &CancelToken) -> Result<()> {
    let payload: TranscribePayload = decode(job.kind, &job.payload)?;

    let project = ctx
        .store
        .get_project(payload.project_id)
        .await?
        .ok_or(WorkerError::NotFound {
            entity: "project",
            id: payload.project_id.to_string(),
        })?;

    let json_key = keys::transcript_json(project.workspace_id, project.id);

    // Short-circuit: stage already past transcription, or artifacts present.
    if project.pipeline_stage.is_at_least(PipelineStage::Transcribed)
        || ctx.blobs.exists(&ctx.buckets.transcripts, &json_key).await?
    {
        info!(project_id = %project.id, "Transcript already present, skipping");
        return enqueue_highlight_detect(job, ctx, payload.project_id).await;
    }

    ctx.admission
        .assert_within_usage(job.workspace_id, UsageMetric::SourceMinutes, 1)
        .await?;

    let ext = payload.source_ext.as_deref().unwrap_or("mp4");
    let source_key = project
        .source_path
        .clone()
        .unwrap_or_else(|| keys::source(project.workspace_id, project.id, ext));

    let tmp = JobTempDir::create(&ctx.temp_root, job.id).await?;
    let local = tmp.file(&format!("source.{}", ext));

    let result: Result<f64> = async {
        ctx.blobs
            .download(&ctx.buckets.videos, &source_key, &local)
            .await?;
        cancel.bail_if_cancelled()?;

        let transcription = ctx.transcriber.transcribe(&local, cancel).await?;

        let srt_key = keys::transcript_srt(project.workspace_id, project.id);
        ctx.blobs
            .upload_bytes_if_absent(
                &ctx.buckets.transcripts,
                &srt_key,
                transcription.srt.as_bytes(),
                "application/x-subrip",
            )
            .await?;
        let transcript_json = serde_json::to_vec(&transcription.transcript)?;
        ctx.blobs
            .upload_bytes_if_absent(
                &ctx.buckets.transcripts,
                &json_key,
                &transcript_json,
                "application/json",
            )
            .await?;

        Ok(transcription.transcript.duration_sec)
    }
    .await;

    tmp.cleanup().await;
    let duration_sec: f64 = result?;

    let minutes = (duration_sec / 60.0).ceil() as i64;
    ctx.admission
        .record_usage(job.workspace_id, UsageMetric::SourceMinutes, minutes)
        .await?;

    let advanced = ctx
        .store
        .advance_stage(project.id, PipelineStage::Transcribed, ctx.clock.now())
        .await?;
    info!(
        project_id = %project.id,
        duration_sec,
        source_minutes = minutes,
        advanced,
        "Transcription stored"
    );

    enqueue_highlight_detect(job, ctx, project.id).await
}

async fn enqueue_highlight_detect(
    job: &Job,
    ctx: &WorkerContext,
    project_id: uuid::Uuid,
) -> Result<()> {
    ctx.queue
        .enqueue(
            JobKind::HighlightDetect,
            serde_json::json!({
                "projectId": project_id,
                "keywords": [],
                "minGapSec": DEFAULT_MIN_GAP_SEC,
            }),
            job.workspace_id,
            None,
        )
        .await?;
    Ok(())
}
