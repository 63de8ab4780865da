//! Pipeline handlers and dispatch
//!
//! A static map from job kind to handler. Handlers are thin orchestration
//! over the ports carried by `WorkerContext`: they short-circuit when their
//! work is already done, guard admission before expensive steps, and only
//! make successor jobs visible after the stage precondition holds.

pub mod cleanup;
pub mod highlight;
pub mod ingest;
pub mod publish;
pub mod render;
pub mod thumbnail;
pub mod transcribe;

#[cfg(test)]
pub mod testutil;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::admission::Admission;
use crate::blobstore::{BlobStore, Buckets};
use crate::cancel::CancelToken;
use crate::clock::SharedClock;
use crate::error::Result;
use crate::media::{SourceDownloader, Transcoder, Transcriber};
use crate::models::{Job, JobKind};
use crate::publish::{Publisher, TokenProvider};
use crate::queue::QueueEngine;
use crate::report::ErrorReporter;
use crate::store::Store;

/// Per-step timeouts, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct StepTimeouts {
    pub render: Duration,
    pub thumbnail: Duration,
    pub transcode: Duration,
    pub upload: Duration,
    pub http: Duration,
}

/// Everything a handler may touch. Assembled once at startup; no globals.
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub blobs: Arc<dyn BlobStore>,
    pub buckets: Buckets,
    pub queue: Arc<QueueEngine>,
    pub clock: SharedClock,
    pub admission: Arc<Admission>,
    pub downloader: Arc<dyn SourceDownloader>,
    pub transcoder: Arc<dyn Transcoder>,
    pub transcriber: Arc<dyn Transcriber>,
    pub token_provider: Arc<dyn TokenProvider>,
    pub tiktok: Arc<dyn Publisher>,
    pub youtube: Arc<dyn Publisher>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub temp_root: PathBuf,
    pub timeouts: StepTimeouts,
    pub default_retention_days: i64,
}

/// Routes a claimed job to its handler.
pub async fn dispatch(job: &Job, ctx: &WorkerContext, cancel: &CancelToken) -> Result<()> {
    match job.kind {
        JobKind::IngestUrl => ingest::handle(job, ctx, cancel).await,
        JobKind::Transcribe => transcribe::handle(job, ctx, cancel).await,
        JobKind::HighlightDetect => highlight::handle(job, ctx, cancel).await,
        JobKind::ClipRender => render::handle(job, ctx, cancel).await,
        JobKind::ThumbnailGen => thumbnail::handle(job, ctx, cancel).await,
        JobKind::PublishTiktok => publish::handle_tiktok(job, ctx, cancel).await,
        JobKind::PublishYoutube => publish::handle_youtube(job, ctx, cancel).await,
        JobKind::CleanupStorage => cleanup::handle(job, ctx, cancel).await,
    }
}
