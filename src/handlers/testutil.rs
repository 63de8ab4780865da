//! Shared fakes and fixtures for handler tests

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::admission::Admission;
use crate::blobstore::{Buckets, MemoryBlobStore};
use crate::cancel::CancelToken;
use crate::clock::ManualClock;
use crate::error::{Result, WorkerError};
use crate::media::{
    SourceDownloader, TranscodeOutput, TranscodeRequest, Transcoder, Transcriber, Transcript,
    TranscriptSegment, TranscriptionResult,
};
use crate::models::{
    Clip, ClipStatus, ConnectedAccount, Job, JobKind, JobState, Platform, Project, ProjectStatus,
};
use crate::publish::{AccessToken, PostSpec, Publisher, TokenProvider};
use crate::queue::{QueueEngine, RetryPolicy};
use crate::report::TracingErrorReporter;
use crate::stage::PipelineStage;
use crate::store::{MemoryStore, Store};

use super::{StepTimeouts, WorkerContext};

#[derive(Default)]
pub struct FakeDownloader {
    calls: AtomicUsize,
    pub fail: Mutex<Option<String>>,
}

#[async_trait]
impl SourceDownloader for FakeDownloader {
    async fn download(&self, _url: &str, dest: &Path, cancel: &CancelToken) -> Result<()> {
        cancel.bail_if_cancelled()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail.lock().clone() {
            return Err(WorkerError::ProviderTransient {
                platform: Some("downloader".into()),
                status: None,
                message,
            });
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, b"fake-video-bytes").await?;
        Ok(())
    }
}

impl FakeDownloader {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeTranscoder {
    runs: AtomicUsize,
    pub fail: Mutex<Option<WorkerErrorKindForTest>>,
}

/// Cloneable stand-ins for the non-cloneable error type.
#[derive(Clone, Copy)]
pub enum WorkerErrorKindForTest {
    Timeout,
    Failed,
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn run(&self, request: TranscodeRequest, cancel: &CancelToken) -> Result<TranscodeOutput> {
        cancel.bail_if_cancelled()?;
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = *self.fail.lock() {
            return Err(match kind {
                WorkerErrorKindForTest::Timeout => WorkerError::TranscoderTimeout {
                    timeout_ms: request.timeout.as_millis() as u64,
                },
                WorkerErrorKindForTest::Failed => WorkerError::TranscoderFailed {
                    exit_code: Some(1),
                    signal: None,
                    stderr_summary: "synthetic failure".into(),
                },
            });
        }
        if let Some(output) = &request.output {
            if let Some(parent) = output.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(output, b"fake-output").await?;
        }
        Ok(TranscodeOutput {
            duration_seconds: request.max_duration_seconds.or(Some(10.0)),
            exit_code: Some(0),
            stderr_summary: String::new(),
        })
    }

    async fn probe_duration(&self, _path: &Path) -> Result<f64> {
        Ok(10.0)
    }
}

impl FakeTranscoder {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

pub struct FakeTranscriber {
    pub result: Mutex<TranscriptionResult>,
    calls: AtomicUsize,
}

impl Default for FakeTranscriber {
    fn default() -> Self {
        Self {
            result: Mutex::new(TranscriptionResult {
                srt: "1\n00:00:00,000 --> 00:00:04,000\nhello\n".into(),
                transcript: Transcript {
                    segments: vec![TranscriptSegment {
                        start: 0.0,
                        end: 45.0,
                        text: "hello world".into(),
                        confidence: Some(0.9),
                    }],
                    duration_sec: 125.0,
                },
            }),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _media: &Path, cancel: &CancelToken) -> Result<TranscriptionResult> {
        cancel.bail_if_cancelled()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.lock().clone())
    }
}

impl FakeTranscriber {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub struct FakePublisher {
    platform: Platform,
    uploads: AtomicUsize,
    pub fail: Mutex<Option<u16>>,
}

impl FakePublisher {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            uploads: AtomicUsize::new(0),
            fail: Mutex::new(None),
        }
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for FakePublisher {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn upload(
        &self,
        _token: &AccessToken,
        _file: &Path,
        _spec: &PostSpec,
        cancel: &CancelToken,
    ) -> Result<String> {
        cancel.bail_if_cancelled()?;
        if let Some(status) = *self.fail.lock() {
            return Err(WorkerError::from_provider_status(
                self.platform.as_str(),
                status,
                "synthetic".into(),
            ));
        }
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}-post-{}", self.platform, n + 1))
    }
}

#[derive(Default)]
pub struct FakeTokenProvider;

#[async_trait]
impl TokenProvider for FakeTokenProvider {
    async fn access_token(&self, account: &ConnectedAccount) -> Result<AccessToken> {
        Ok(AccessToken {
            token: format!("token-{}", account.id),
            expires_at: None,
        })
    }
}

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub clock: Arc<ManualClock>,
    pub queue: Arc<QueueEngine>,
    pub downloader: Arc<FakeDownloader>,
    pub transcoder: Arc<FakeTranscoder>,
    pub transcriber: Arc<FakeTranscriber>,
    pub tiktok: Arc<FakePublisher>,
    pub youtube: Arc<FakePublisher>,
    pub temp: tempfile::TempDir,
    workspace_id: Uuid,
}

impl TestHarness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = Arc::new(QueueEngine::new(
            store.clone(),
            clock.clone(),
            RetryPolicy::default(),
        ));
        Self {
            store,
            blobs: Arc::new(MemoryBlobStore::new()),
            clock,
            queue,
            downloader: Arc::new(FakeDownloader::default()),
            transcoder: Arc::new(FakeTranscoder::default()),
            transcriber: Arc::new(FakeTranscriber::default()),
            tiktok: Arc::new(FakePublisher::new(Platform::Tiktok)),
            youtube: Arc::new(FakePublisher::new(Platform::Youtube)),
            temp: tempfile::tempdir().expect("temp dir"),
            workspace_id: Uuid::new_v4(),
        }
    }

    pub fn workspace_id(&self) -> Uuid {
        self.workspace_id
    }

    pub fn project(&self) -> Project {
        self.project_at(PipelineStage::Uploaded)
    }

    pub fn project_at(&self, stage: PipelineStage) -> Project {
        let now = self.clock.now();
        let project = Project {
            id: Uuid::new_v4(),
            workspace_id: self.workspace_id,
            status: ProjectStatus::Queued,
            pipeline_stage: stage,
            source_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.store.seed_project(project.clone());
        project
    }

    pub fn clip(&self, project: &Project, start_s: f64, end_s: f64, status: ClipStatus) -> Clip {
        let now = self.clock.now();
        let clip = Clip {
            id: Uuid::new_v4(),
            project_id: project.id,
            workspace_id: project.workspace_id,
            start_s,
            end_s,
            confidence: 0.8,
            title: "Highlight".into(),
            status,
            storage_path: None,
            thumb_path: None,
            external_id: None,
            keywords_hit: 0,
            published_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.seed_clip(clip.clone());
        clip
    }

    pub fn account(&self, platform: Platform) -> ConnectedAccount {
        let account = ConnectedAccount {
            id: Uuid::new_v4(),
            workspace_id: self.workspace_id,
            platform,
            external_id: "ext-1".into(),
            access_token_ref: "stored-token".into(),
            refresh_token_ref: Some("refresh".into()),
            expires_at: Some(self.clock.now() + chrono::Duration::hours(2)),
            scopes: None,
            status: None,
        };
        self.store.seed_account(account.clone());
        account
    }

    /// A claimed-shape job handed straight to a handler.
    pub fn job(&self, kind: JobKind, workspace_id: Uuid, payload: serde_json::Value) -> Job {
        let mut job = Job::enqueue(workspace_id, kind, payload, self.clock.now());
        job.state = JobState::Running;
        job.attempts = 1;
        job.locked_by = Some("test-worker".into());
        job.locked_at = Some(self.clock.now());
        job
    }

    pub fn queued_jobs(&self, kind: JobKind) -> Vec<Job> {
        self.store
            .all_jobs()
            .into_iter()
            .filter(|j| j.kind == kind && j.state == JobState::Queued)
            .collect()
    }
}

pub fn test_context(harness: &TestHarness) -> WorkerContext {
    WorkerContext {
        store: harness.store.clone(),
        blobs: harness.blobs.clone(),
        buckets: Buckets {
            videos: "videos".into(),
            transcripts: "transcripts".into(),
            renders: "renders".into(),
            thumbs: "thumbs".into(),
        },
        queue: harness.queue.clone(),
        clock: harness.clock.clone(),
        admission: Arc::new(Admission::new(harness.store.clone(), harness.clock.clone())),
        downloader: harness.downloader.clone(),
        transcoder: harness.transcoder.clone(),
        transcriber: harness.transcriber.clone(),
        token_provider: Arc::new(FakeTokenProvider),
        tiktok: harness.tiktok.clone(),
        youtube: harness.youtube.clone(),
        reporter: Arc::new(TracingErrorReporter),
        temp_root: harness.temp.path().to_path_buf(),
        timeouts: StepTimeouts {
            render: std::time::Duration::from_secs(600),
            thumbnail: std::time::Duration::from_secs(120),
            transcode: std::time::Duration::from_secs(300),
            upload: std::time::Duration::from_secs(600),
            http: std::time::Duration::from_secs(30),
        },
        default_retention_days: 30,
    }
}
