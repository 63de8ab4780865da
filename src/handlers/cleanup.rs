//! Storage cleanup handler
//!
//! Retention sweep over derived artifacts. Source videos and transcripts
//! are never touched. Both phases are best-effort: failures are logged and
//! the sweep keeps going.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};
use uuid::Uuid;

use crate::blobstore::keys;
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::models::payload::decode;
use crate::models::{CleanupStoragePayload, Job};

use super::WorkerContext;

/// Retention floor; anything lower is clamped up.
const MIN_RETENTION_DAYS: i64 = 7;
/// Keys deleted per batch call.
const DELETE_BATCH: usize = 500;

pub async fn handle(job: &Job, ctx: &WorkerContext, cancel: &CancelToken) -> Result<()> {
    let payload: CleanupStoragePayload = decode(job.kind, &job.payload)?;

    let retention_days = payload
        .retention_days
        .unwrap_or(ctx.default_retention_days)
        .max(MIN_RETENTION_DAYS);
    let cutoff = ctx.clock.now() - chrono::Duration::days(retention_days);

    info!(
        workspace_id = ?payload.workspace_id,
        project_id = ?payload.project_id,
        retention_days,
        "Starting storage cleanup"
    );

    sweep_failed_renders(ctx, &payload, cutoff, cancel).await;
    cancel.bail_if_cancelled()?;
    sweep_orphaned_renders(ctx, &payload, cancel).await;

    Ok(())
}

/// Phase 1: artifacts of clips that failed long ago.
async fn sweep_failed_renders(
    ctx: &WorkerContext,
    payload: &CleanupStoragePayload,
    cutoff: chrono::DateTime<chrono::Utc>,
    cancel: &CancelToken,
) {
    let clips = match ctx
        .store
        .list_failed_clips_before(cutoff, payload.workspace_id, payload.project_id)
        .await
    {
        Ok(clips) => clips,
        Err(e) => {
            warn!(error = %e, "Failed-render sweep could not list clips");
            return;
        }
    };

    let mut render_keys = Vec::new();
    let mut thumb_keys = Vec::new();
    for clip in &clips {
        if let Some(path) = &clip.storage_path {
            render_keys.push(path.clone());
        }
        if let Some(path) = &clip.thumb_path {
            thumb_keys.push(path.clone());
        }
    }

    let mut removed = 0usize;
    for (bucket, keys) in [
        (&ctx.buckets.renders, &render_keys),
        (&ctx.buckets.thumbs, &thumb_keys),
    ] {
        for batch in keys.chunks(DELETE_BATCH) {
            if cancel.is_cancelled() {
                return;
            }
            match ctx.blobs.remove_batch(bucket, batch).await {
                Ok(()) => removed += batch.len(),
                Err(e) => warn!(bucket, error = %e, "Failed-render batch delete failed"),
            }
        }
    }

    info!(
        failed_clips = clips.len(),
        keys_removed = removed,
        "Failed-render sweep complete"
    );
}

/// Phase 2: render objects whose clip row no longer exists.
async fn sweep_orphaned_renders(
    ctx: &WorkerContext,
    payload: &CleanupStoragePayload,
    cancel: &CancelToken,
) {
    let prefix = match (payload.workspace_id, payload.project_id) {
        (Some(ws), Some(project)) => format!("{}/{}/", ws, project),
        (Some(ws), None) => format!("{}/", ws),
        _ => String::new(),
    };

    let keys_in_bucket = match ctx.blobs.list(&ctx.buckets.renders, &prefix).await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "Orphan sweep could not list render keys");
            return;
        }
    };

    // Group keys by the clip id embedded in the file name; foreign keys
    // (anything not `{uuid}.mp4`) are left alone.
    let mut by_clip: HashMap<Uuid, Vec<String>> = HashMap::new();
    for key in keys_in_bucket {
        if let Some(clip_id) = keys::clip_id_from_render_key(&key) {
            by_clip.entry(clip_id).or_default().push(key);
        }
    }
    if by_clip.is_empty() {
        return;
    }

    let ids: Vec<Uuid> = by_clip.keys().copied().collect();
    let existing: HashSet<Uuid> = match ctx.store.existing_clip_ids(&ids).await {
        Ok(ids) => ids.into_iter().collect(),
        Err(e) => {
            warn!(error = %e, "Orphan sweep could not resolve clip ids");
            return;
        }
    };

    let orphaned: Vec<String> = by_clip
        .into_iter()
        .filter(|(clip_id, _)| !existing.contains(clip_id))
        .flat_map(|(_, keys)| keys)
        .collect();

    let mut removed = 0usize;
    for batch in orphaned.chunks(DELETE_BATCH) {
        if cancel.is_cancelled() {
            return;
        }
        match ctx.blobs.remove_batch(&ctx.buckets.renders, batch).await {
            Ok(()) => removed += batch.len(),
            Err(e) => warn!(error = %e, "Orphan batch delete failed"),
        }
    }

    info!(keys_removed = removed, "Orphan sweep complete");
}
