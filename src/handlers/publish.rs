//! Publish handlers (TikTok / YouTube)
//!
//! One shared flow behind two payload shapes. The variant-post table is the
//! authoritative publish record; at most one posted row exists per
//! (clip, account, platform). The legacy `clip.external_id` is honored as a
//! read-only short-circuit for pre-variant projects.
//!
//! After a successful remote upload the recording writes (variant post,
//! usage counter, stage advance) must not fail the job: their errors are
//! logged and swallowed so a transient DB blip cannot trigger a re-post.

use std::path::PathBuf;

use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::{Result, WorkerError};
use crate::models::payload::decode;
use crate::models::{
    Clip, ClipStatus, Job, Platform, PublishTiktokPayload, PublishYoutubePayload, UsageMetric,
    VariantPost, VariantPostStatus,
};
use crate::publish::PostSpec;
use crate::stage::PipelineStage;
use crate::tempfiles::JobTempDir;

use super::WorkerContext;

struct PublishRequest {
    clip_id: Uuid,
    connected_account_id: Uuid,
    experiment_id: Option<String>,
    variant_id: Option<String>,
    spec: PostSpec,
}

pub async fn handle_tiktok(job: &Job, ctx: &WorkerContext, cancel: &CancelToken) -> Result<()> {
    let payload: PublishTiktokPayload = decode(job.kind, &job.payload)?;
    let request = PublishRequest {
        clip_id: payload.clip_id,
        connected_account_id: payload.connected_account_id,
        experiment_id: payload.experiment_id,
        variant_id: payload.variant_id,
        spec: PostSpec {
            caption: payload.caption,
            privacy_level: payload.privacy_level,
            ..PostSpec::default()
        },
    };
    run(job, ctx, cancel, Platform::Tiktok, request).await
}

pub async fn handle_youtube(job: &Job, ctx: &WorkerContext, cancel: &CancelToken) -> Result<()> {
    let payload: PublishYoutubePayload = decode(job.kind, &job.payload)?;
    let request = PublishRequest {
        clip_id: payload.clip_id,
        connected_account_id: payload.connected_account_id,
        experiment_id: payload.experiment_id,
        variant_id: payload.variant_id,
        spec: PostSpec {
            title: payload.title,
            description: payload.description,
            tags: payload.tags,
            visibility: payload.visibility,
            ..PostSpec::default()
        },
    };
    run(job, ctx, cancel, Platform::Youtube, request).await
}

async fn run(
    job: &Job,
    ctx: &WorkerContext,
    cancel: &CancelToken,
    platform: Platform,
    request: PublishRequest,
) -> Result<()> {
    let clip = ctx
        .store
        .get_clip(request.clip_id)
        .await?
        .ok_or(WorkerError::NotFound {
            entity: "clip",
            id: request.clip_id.to_string(),
        })?;
    let project = ctx
        .store
        .get_project(clip.project_id)
        .await?
        .ok_or(WorkerError::NotFound {
            entity: "project",
            id: clip.project_id.to_string(),
        })?;

    // Idempotency short-circuits before any remote call.
    if project.pipeline_stage.is_at_least(PipelineStage::Published) {
        info!(clip_id = %clip.id, "Project already published, skipping");
        return Ok(());
    }
    let existing = ctx
        .store
        .find_variant_post(clip.id, request.connected_account_id, platform)
        .await?;
    if let Some(post) = &existing {
        if post.status == VariantPostStatus::Posted {
            info!(
                clip_id = %clip.id,
                platform_post_id = ?post.platform_post_id,
                "Variant already posted, skipping"
            );
            return Ok(());
        }
    }
    // Legacy single-target projects recorded only clip.external_id.
    if existing.is_none() && request.experiment_id.is_none() {
        if let Some(external_id) = &clip.external_id {
            if !external_id.is_empty() {
                info!(clip_id = %clip.id, external_id = %external_id, "Legacy publish record found, skipping");
                return Ok(());
            }
        }
    }

    // The clip must have finished rendering.
    let storage_path = match (&clip.status, &clip.storage_path) {
        (ClipStatus::Ready | ClipStatus::Published, Some(path)) => path.clone(),
        _ => {
            return Err(WorkerError::PreconditionFailed(format!(
                "clip {} is {} without a rendered artifact",
                clip.id,
                clip.status.as_str()
            )))
        }
    };

    let account = ctx
        .store
        .get_connected_account(request.connected_account_id)
        .await?
        .ok_or(WorkerError::NotFound {
            entity: "connected account",
            id: request.connected_account_id.to_string(),
        })?;
    if account.platform != platform {
        return Err(WorkerError::PreconditionFailed(format!(
            "account {} is for {}, not {}",
            account.id, account.platform, platform
        )));
    }
    if account.workspace_id != job.workspace_id {
        return Err(WorkerError::PreconditionFailed(
            "connected account belongs to a different workspace".into(),
        ));
    }

    // Admission: rate windows first (cheap, retryable), then quota (fatal).
    ctx.admission
        .enforce_post_limits(job.workspace_id, account.id, platform)
        .await?;
    ctx.admission
        .assert_within_usage(job.workspace_id, UsageMetric::Posts, 1)
        .await?;

    let tmp = JobTempDir::create(&ctx.temp_root, job.id).await?;
    let upload_result = async {
        let local: PathBuf = tmp.file("clip.mp4");
        ctx.blobs
            .download(&ctx.buckets.renders, &storage_path, &local)
            .await?;
        cancel.bail_if_cancelled()?;

        let token = ctx.token_provider.access_token(&account).await?;
        let publisher = match platform {
            Platform::Tiktok => &ctx.tiktok,
            Platform::Youtube => &ctx.youtube,
        };
        publisher.upload(&token, &local, &request.spec, cancel).await
    }
    .await;
    tmp.cleanup().await;
    let platform_post_id = upload_result?;

    record_success(job, ctx, &clip, &request, platform, &platform_post_id).await;

    info!(
        clip_id = %clip.id,
        platform = %platform,
        platform_post_id = %platform_post_id,
        "Clip published"
    );
    Ok(())
}

/// Post-upload recording. The remote side effect already happened, so these
/// writes log failures instead of failing (and re-running) the job.
async fn record_success(
    job: &Job,
    ctx: &WorkerContext,
    clip: &Clip,
    request: &PublishRequest,
    platform: Platform,
    platform_post_id: &str,
) {
    let now = ctx.clock.now();

    if let Err(e) = ctx
        .store
        .mark_clip_published(clip.id, platform_post_id, now)
        .await
    {
        warn!(clip_id = %clip.id, error = %e, "Failed to mark clip published");
    }

    let post = VariantPost {
        id: Uuid::new_v4(),
        clip_id: clip.id,
        connected_account_id: request.connected_account_id,
        platform,
        variant_id: request.variant_id.clone(),
        status: VariantPostStatus::Posted,
        platform_post_id: Some(platform_post_id.to_string()),
        posted_at: Some(now),
        created_at: now,
        updated_at: now,
    };
    if let Err(e) = ctx.store.upsert_variant_post(&post).await {
        warn!(clip_id = %clip.id, error = %e, "Failed to record variant post");
    }

    if let Err(e) = ctx
        .admission
        .record_usage(job.workspace_id, UsageMetric::Posts, 1)
        .await
    {
        warn!(workspace_id = %job.workspace_id, error = %e, "Failed to record post usage");
    }

    match ctx
        .store
        .advance_stage(clip.project_id, PipelineStage::Published, now)
        .await
    {
        Ok(advanced) => {
            if advanced {
                info!(project_id = %clip.project_id, "Project published");
            }
        }
        Err(e) => warn!(project_id = %clip.project_id, error = %e, "Stage advance failed"),
    }
}
