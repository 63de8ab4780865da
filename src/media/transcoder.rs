//! Safe transcoder wrapper
//!
//! Spawns ffmpeg with a hard timeout and cancellation, keeps a bounded
//! stderr tail for diagnostics, and validates output duration so a
//! truncated render never gets marked ready.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{Result, WorkerError};

/// Lines of stderr kept for the failure summary.
const STDERR_TAIL_LINES: usize = 40;
/// Slack allowed between requested and probed output duration.
const DURATION_TOLERANCE_S: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub args: Vec<String>,
    pub timeout: Duration,
    /// When set together with `output`, the probed duration must not exceed
    /// this by more than the tolerance.
    pub max_duration_seconds: Option<f64>,
    /// Output file to validate after a zero exit.
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TranscodeOutput {
    pub duration_seconds: Option<f64>,
    pub exit_code: Option<i32>,
    pub stderr_summary: String,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn run(&self, request: TranscodeRequest, cancel: &CancelToken) -> Result<TranscodeOutput>;

    /// Container duration of a media file, in seconds.
    async fn probe_duration(&self, path: &Path) -> Result<f64>;
}

pub struct FfmpegTranscoder {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn run(&self, request: TranscodeRequest, cancel: &CancelToken) -> Result<TranscodeOutput> {
        cancel.bail_if_cancelled()?;

        debug!(
            program = %self.ffmpeg_path,
            args = %request.args.join(" "),
            timeout_secs = request.timeout.as_secs(),
            "Spawning transcoder"
        );

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Drain stderr concurrently, keeping only the tail.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            }
            tail.join("\n")
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(request.timeout) => {
                let _ = child.kill().await;
                let _ = stderr_task.await;
                return Err(WorkerError::TranscoderTimeout {
                    timeout_ms: request.timeout.as_millis() as u64,
                });
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = stderr_task.await;
                return Err(WorkerError::Cancelled);
            }
        };

        let stderr_summary = stderr_task.await.unwrap_or_default();

        if !status.success() {
            #[cfg(unix)]
            let signal = std::os::unix::process::ExitStatusExt::signal(&status);
            #[cfg(not(unix))]
            let signal = None;
            return Err(WorkerError::TranscoderFailed {
                exit_code: status.code(),
                signal,
                stderr_summary,
            });
        }

        let mut duration_seconds = None;
        if let Some(output) = &request.output {
            let duration = self.probe_duration(output).await?;
            if duration <= 0.0 {
                return Err(WorkerError::TranscoderFailed {
                    exit_code: status.code(),
                    signal: None,
                    stderr_summary: format!("empty output: {}", output.display()),
                });
            }
            if let Some(max) = request.max_duration_seconds {
                if duration > max + DURATION_TOLERANCE_S {
                    return Err(WorkerError::TranscoderFailed {
                        exit_code: status.code(),
                        signal: None,
                        stderr_summary: format!(
                            "output duration {:.2}s exceeds expected {:.2}s",
                            duration, max
                        ),
                    });
                }
            }
            duration_seconds = Some(duration);
        }

        Ok(TranscodeOutput {
            duration_seconds,
            exit_code: status.code(),
            stderr_summary,
        })
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            warn!(path = %path.display(), "ffprobe failed");
            return Err(WorkerError::TranscoderFailed {
                exit_code: output.status.code(),
                signal: None,
                stderr_summary: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout);
        text.trim().parse::<f64>().map_err(|_| {
            WorkerError::Internal(format!("unparseable ffprobe duration: {:?}", text.trim()))
        })
    }
}
