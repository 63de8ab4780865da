//! Readiness probe
//!
//! One-shot check used by deploy tooling: environment, database
//! connectivity, queue read, and the external binaries the pipeline shells
//! out to. Emits structured JSON and maps to exit 0/1.

use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;

use crate::config::Config;
use crate::store::{PostgresStore, Store};

#[derive(Debug, Serialize)]
pub struct ReadinessReport {
    pub ok: bool,
    pub checks: ReadinessChecks,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ReadinessChecks {
    pub env: bool,
    pub database: bool,
    pub queue: bool,
    pub ffmpeg: bool,
    pub ffprobe: bool,
    pub downloader: bool,
}

impl ReadinessReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{\"ok\":false}".to_string())
    }
}

/// Runs every check, collecting failures instead of stopping at the first.
pub async fn check(config: &Config) -> ReadinessReport {
    let mut checks = ReadinessChecks::default();
    let mut errors = Vec::new();

    // Required configuration.
    checks.env = config.database_url.is_some() && config.has_transcriber();
    if config.database_url.is_none() {
        errors.push("DATABASE_URL is not set".to_string());
    }
    if !config.has_transcriber() {
        errors.push("TRANSCRIBER_URL is not set".to_string());
    }

    // Database connectivity and a queue read.
    if let Some(url) = &config.database_url {
        match PostgresStore::connect(url).await {
            Ok(store) => {
                checks.database = store.ping().await.is_ok();
                match store.count_jobs().await {
                    Ok(_) => checks.queue = true,
                    Err(e) => errors.push(format!("queue read failed: {}", e)),
                }
            }
            Err(e) => errors.push(format!("database connect failed: {}", e)),
        }
    }

    // External binaries.
    checks.ffmpeg = binary_responds(&config.ffmpeg_path, "-version").await;
    if !checks.ffmpeg {
        errors.push(format!("{} not runnable", config.ffmpeg_path));
    }
    checks.ffprobe = binary_responds(&config.ffprobe_path, "-version").await;
    if !checks.ffprobe {
        errors.push(format!("{} not runnable", config.ffprobe_path));
    }
    checks.downloader = binary_responds(&config.downloader_path, "--version").await;
    if !checks.downloader {
        errors.push(format!("{} not runnable", config.downloader_path));
    }

    let ok = checks.env
        && checks.database
        && checks.queue
        && checks.ffmpeg
        && checks.ffprobe
        && checks.downloader;
    ReadinessReport { ok, checks, errors }
}

/// Bootstrap-time binary verification; returns one message per missing
/// tool. The worker refuses to start when this is non-empty.
pub async fn verify_binaries(config: &Config) -> Vec<String> {
    let mut errors = Vec::new();
    for (binary, flag) in [
        (config.ffmpeg_path.as_str(), "-version"),
        (config.ffprobe_path.as_str(), "-version"),
        (config.downloader_path.as_str(), "--version"),
    ] {
        if !binary_responds(binary, flag).await {
            errors.push(format!("{} not runnable", binary));
        }
    }
    errors
}

async fn binary_responds(binary: &str, flag: &str) -> bool {
    Command::new(binary)
        .arg(flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}
