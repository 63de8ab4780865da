//! End-to-end pipeline tests over in-memory backends
//!
//! Drives real jobs through claim → dispatch → finalize against the
//! in-memory store and blob store, with fake media/publisher ports. Checks
//! the cross-handler invariants: stage monotonicity, non-overlapping clips,
//! publish idempotency, and dead-letter behavior.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use cliply_worker::admission::Admission;
use cliply_worker::blobstore::{keys, Buckets, MemoryBlobStore};
use cliply_worker::cancel::CancelToken;
use cliply_worker::clock::{Clock, ManualClock};
use cliply_worker::error::Result as WorkerResult;
use cliply_worker::handlers::{dispatch, StepTimeouts, WorkerContext};
use cliply_worker::media::{
    SourceDownloader, TranscodeOutput, TranscodeRequest, Transcoder, Transcriber, Transcript,
    TranscriptSegment, TranscriptionResult,
};
use cliply_worker::models::{
    ClipStatus, ConnectedAccount, JobKind, JobState, Platform, Project, ProjectStatus,
};
use cliply_worker::publish::{AccessToken, PostSpec, Publisher, TokenProvider};
use cliply_worker::queue::{QueueEngine, RetryPolicy};
use cliply_worker::report::TracingErrorReporter;
use cliply_worker::stage::PipelineStage;
use cliply_worker::store::{MemoryStore, Store};

// ---- fakes -------------------------------------------------------------

struct StubDownloader;

#[async_trait]
impl SourceDownloader for StubDownloader {
    async fn download(&self, _url: &str, dest: &Path, _cancel: &CancelToken) -> WorkerResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, b"source-bytes").await?;
        Ok(())
    }
}

struct StubTranscoder;

#[async_trait]
impl Transcoder for StubTranscoder {
    async fn run(
        &self,
        request: TranscodeRequest,
        _cancel: &CancelToken,
    ) -> WorkerResult<TranscodeOutput> {
        if let Some(output) = &request.output {
            if let Some(parent) = output.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(output, b"rendered-bytes").await?;
        }
        // Thumbnail extraction names its output as the last argument.
        if let Some(last) = request.args.last() {
            if last.ends_with(".jpg") {
                tokio::fs::write(last, b"jpeg-bytes").await?;
            }
        }
        Ok(TranscodeOutput {
            duration_seconds: request.max_duration_seconds.or(Some(5.0)),
            exit_code: Some(0),
            stderr_summary: String::new(),
        })
    }

    async fn probe_duration(&self, _path: &Path) -> WorkerResult<f64> {
        Ok(5.0)
    }
}

struct StubTranscriber;

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(
        &self,
        _media: &Path,
        _cancel: &CancelToken,
    ) -> WorkerResult<TranscriptionResult> {
        let transcript = Transcript {
            segments: vec![
                TranscriptSegment {
                    start: 0.0,
                    end: 22.0,
                    text: "The opening hook everyone quotes.".into(),
                    confidence: Some(0.95),
                },
                TranscriptSegment {
                    start: 90.0,
                    end: 120.0,
                    text: "A second standalone segment.".into(),
                    confidence: Some(0.85),
                },
            ],
            duration_sec: 300.0,
        };
        Ok(TranscriptionResult {
            srt: "1\n00:00:00,000 --> 00:00:22,000\nThe opening hook\n".into(),
            transcript,
        })
    }
}

struct CountingPublisher {
    platform: Platform,
    uploads: AtomicUsize,
}

#[async_trait]
impl Publisher for CountingPublisher {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn upload(
        &self,
        _token: &AccessToken,
        _file: &Path,
        _spec: &PostSpec,
        _cancel: &CancelToken,
    ) -> WorkerResult<String> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("remote-{}", n + 1))
    }
}

struct StubTokens;

#[async_trait]
impl TokenProvider for StubTokens {
    async fn access_token(&self, _account: &ConnectedAccount) -> WorkerResult<AccessToken> {
        Ok(AccessToken {
            token: "tok".into(),
            expires_at: None,
        })
    }
}

// ---- world -------------------------------------------------------------

struct World {
    store: Arc<MemoryStore>,
    blobs: Arc<MemoryBlobStore>,
    clock: Arc<ManualClock>,
    queue: Arc<QueueEngine>,
    ctx: Arc<WorkerContext>,
    tiktok_uploads: Arc<CountingPublisher>,
    _temp: tempfile::TempDir,
}

fn build_world() -> World {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = Arc::new(QueueEngine::new(
        store.clone(),
        clock.clone(),
        RetryPolicy::default(),
    ));
    let blobs = Arc::new(MemoryBlobStore::new());
    let temp = tempfile::tempdir().expect("temp dir");
    let tiktok = Arc::new(CountingPublisher {
        platform: Platform::Tiktok,
        uploads: AtomicUsize::new(0),
    });
    let youtube = Arc::new(CountingPublisher {
        platform: Platform::Youtube,
        uploads: AtomicUsize::new(0),
    });

    let ctx = Arc::new(WorkerContext {
        store: store.clone(),
        blobs: blobs.clone(),
        buckets: Buckets {
            videos: "videos".into(),
            transcripts: "transcripts".into(),
            renders: "renders".into(),
            thumbs: "thumbs".into(),
        },
        queue: queue.clone(),
        clock: clock.clone(),
        admission: Arc::new(Admission::new(store.clone(), clock.clone())),
        downloader: Arc::new(StubDownloader),
        transcoder: Arc::new(StubTranscoder),
        transcriber: Arc::new(StubTranscriber),
        token_provider: Arc::new(StubTokens),
        tiktok: tiktok.clone(),
        youtube,
        reporter: Arc::new(TracingErrorReporter),
        temp_root: temp.path().to_path_buf(),
        timeouts: StepTimeouts {
            render: Duration::from_secs(600),
            thumbnail: Duration::from_secs(120),
            transcode: Duration::from_secs(300),
            upload: Duration::from_secs(600),
            http: Duration::from_secs(30),
        },
        default_retention_days: 30,
    });

    World {
        store,
        blobs,
        clock,
        queue,
        ctx,
        tiktok_uploads: tiktok,
        _temp: temp,
    }
}

fn seed_project(world: &World) -> Project {
    let now = world.clock.now();
    let project = Project {
        id: Uuid::new_v4(),
        workspace_id: Uuid::new_v4(),
        status: ProjectStatus::Queued,
        pipeline_stage: PipelineStage::Uploaded,
        source_path: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };
    world.store.seed_project(project.clone());
    project
}

fn seed_account(world: &World, workspace_id: Uuid, platform: Platform) -> ConnectedAccount {
    let account = ConnectedAccount {
        id: Uuid::new_v4(),
        workspace_id,
        platform,
        external_id: "ext".into(),
        access_token_ref: "stored".into(),
        refresh_token_ref: None,
        expires_at: Some(world.clock.now() + chrono::Duration::hours(4)),
        scopes: None,
        status: None,
    };
    world.store.seed_account(account.clone());
    account
}

/// Claims and executes jobs until the queue is empty, advancing the clock
/// past retry delays between passes. Returns the number of jobs executed.
async fn drain_queue(world: &World) -> usize {
    let mut executed = 0;
    for _ in 0..200 {
        match world.queue.claim("it-worker", None, None).await.unwrap() {
            Some(job) => {
                let result = dispatch(&job, &world.ctx, &CancelToken::never()).await;
                world.queue.finalize(&job, result).await.unwrap();
                executed += 1;
            }
            None => {
                // Jump past any scheduled retries; stop once nothing is
                // waiting at all.
                let pending = world
                    .store
                    .all_jobs()
                    .into_iter()
                    .any(|j| j.state == JobState::Queued);
                if !pending {
                    return executed;
                }
                world.clock.advance(Duration::from_secs(120));
            }
        }
    }
    panic!("queue never drained");
}

// ---- tests -------------------------------------------------------------

#[tokio::test]
async fn test_full_pipeline_ingest_to_publish() {
    let world = build_world();
    let project = seed_project(&world);
    let account = seed_account(&world, project.workspace_id, Platform::Tiktok);

    world
        .queue
        .enqueue(
            JobKind::IngestUrl,
            json!({
                "projectId": project.id,
                "sourceUrl": "https://www.youtube.com/watch?v=abc123"
            }),
            project.workspace_id,
            None,
        )
        .await
        .unwrap();

    // Ingest → transcribe → highlight-detect → renders.
    drain_queue(&world).await;

    let after = world.store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(after.pipeline_stage, PipelineStage::Rendered);
    assert_eq!(after.status, ProjectStatus::Ready);

    // Two non-overlapping segments became two rendered clips.
    let clips = world.store.list_clips(project.id).await.unwrap();
    assert_eq!(clips.len(), 2);
    for clip in &clips {
        assert_eq!(clip.status, ClipStatus::Ready);
        let render_key = keys::render(clip.workspace_id, clip.project_id, clip.id);
        assert!(world.blobs.get("renders", &render_key).is_some());
    }
    for pair in clips.windows(2) {
        assert!(
            pair[0].end_s <= pair[1].start_s,
            "clips overlap: {:?} vs {:?}",
            (pair[0].start_s, pair[0].end_s),
            (pair[1].start_s, pair[1].end_s)
        );
    }

    // Transcript artifacts exist under deterministic keys.
    assert!(world
        .blobs
        .get(
            "transcripts",
            &keys::transcript_json(project.workspace_id, project.id)
        )
        .is_some());

    // Publish the first clip.
    world
        .queue
        .enqueue(
            JobKind::PublishTiktok,
            json!({"clipId": clips[0].id, "connectedAccountId": account.id, "caption": "hi"}),
            project.workspace_id,
            None,
        )
        .await
        .unwrap();
    drain_queue(&world).await;

    let after = world.store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(after.pipeline_stage, PipelineStage::Published);
    assert_eq!(world.tiktok_uploads.uploads.load(Ordering::SeqCst), 1);

    // Replaying the same publish job is a no-op on the remote side.
    world
        .queue
        .enqueue(
            JobKind::PublishTiktok,
            json!({"clipId": clips[0].id, "connectedAccountId": account.id, "caption": "hi"}),
            project.workspace_id,
            None,
        )
        .await
        .unwrap();
    drain_queue(&world).await;
    assert_eq!(world.tiktok_uploads.uploads.load(Ordering::SeqCst), 1);

    // Every executed job ended in a terminal or queued-for-later state;
    // none are stuck running.
    for job in world.store.all_jobs() {
        assert_ne!(job.state, JobState::Running, "job {} left running", job.id);
        assert!(job.attempts <= job.max_attempts);
    }
}

#[tokio::test]
async fn test_replaying_pipeline_jobs_creates_no_duplicates() {
    let world = build_world();
    let project = seed_project(&world);

    world
        .queue
        .enqueue(
            JobKind::IngestUrl,
            json!({
                "projectId": project.id,
                "sourceUrl": "https://youtu.be/abc123"
            }),
            project.workspace_id,
            None,
        )
        .await
        .unwrap();
    drain_queue(&world).await;
    let clips_before = world.store.list_clips(project.id).await.unwrap();
    let renders_before = world.blobs.object_count("renders");

    // Re-run the whole chain from the top.
    world
        .queue
        .enqueue(
            JobKind::IngestUrl,
            json!({
                "projectId": project.id,
                "sourceUrl": "https://youtu.be/abc123"
            }),
            project.workspace_id,
            None,
        )
        .await
        .unwrap();
    drain_queue(&world).await;

    let clips_after = world.store.list_clips(project.id).await.unwrap();
    assert_eq!(clips_before.len(), clips_after.len());
    assert_eq!(renders_before, world.blobs.object_count("renders"));

    // Stage never regressed.
    let after = world.store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(after.pipeline_stage, PipelineStage::Rendered);
}

#[tokio::test]
async fn test_invalid_payload_dead_letters_and_requeue_resets_attempts() {
    let world = build_world();

    let job = world
        .queue
        .enqueue(
            JobKind::ClipRender,
            json!({"clipId": "definitely-not-a-uuid"}),
            Uuid::new_v4(),
            None,
        )
        .await
        .unwrap();
    drain_queue(&world).await;

    let dead = world.store.job_snapshot(job.id).unwrap();
    assert_eq!(dead.state, JobState::DeadLetter);
    assert!(dead.last_error.as_deref().unwrap().contains("payload"));

    // Admin requeue: fresh attempt budget, last_error preserved.
    let requeued = world.queue.requeue_dead_letter(job.id).await.unwrap();
    assert_eq!(requeued.state, JobState::Queued);
    assert_eq!(requeued.attempts, 0);
    assert!(requeued.last_error.is_some());

    // It dead-letters again (payload is still invalid), which is fine.
    drain_queue(&world).await;
    assert_eq!(
        world.store.job_snapshot(job.id).unwrap().state,
        JobState::DeadLetter
    );
}

#[tokio::test]
async fn test_missing_rows_dead_letter_quickly() {
    let world = build_world();

    let job = world
        .queue
        .enqueue(
            JobKind::Transcribe,
            json!({"projectId": Uuid::new_v4()}),
            Uuid::new_v4(),
            None,
        )
        .await
        .unwrap();
    let executed = drain_queue(&world).await;

    // NotFound is non-retryable: exactly one execution.
    assert_eq!(executed, 1);
    assert_eq!(
        world.store.job_snapshot(job.id).unwrap().state,
        JobState::DeadLetter
    );
}

#[tokio::test]
async fn test_scheduled_jobs_respect_run_at() {
    let world = build_world();
    let later = world.clock.now() + chrono::Duration::minutes(10);

    let job = world
        .queue
        .enqueue(
            JobKind::CleanupStorage,
            json!({}),
            Uuid::new_v4(),
            Some(later),
        )
        .await
        .unwrap();

    // Not yet eligible.
    assert!(world.queue.claim("w", None, None).await.unwrap().is_none());

    world.clock.advance(Duration::from_secs(11 * 60));
    let claimed = world.queue.claim("w", None, None).await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
}
