//! Configuration for the worker runtime

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Database
    pub database_url: Option<String>,

    // Worker pool
    /// Concurrent handler slots; defaults to a CPU-based cap.
    pub worker_slots: Option<usize>,
    /// Restrict this worker to specific job kinds (comma-separated names).
    pub worker_kinds: Option<String>,

    // Queue timing
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_claim_poll_min_ms")]
    pub claim_poll_min_ms: u64,
    #[serde(default = "default_claim_poll_max_ms")]
    pub claim_poll_max_ms: u64,

    // Retry backoff
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    // Blob storage buckets
    #[serde(default = "default_videos_bucket")]
    pub videos_bucket: String,
    #[serde(default = "default_transcripts_bucket")]
    pub transcripts_bucket: String,
    #[serde(default = "default_renders_bucket")]
    pub renders_bucket: String,
    #[serde(default = "default_thumbs_bucket")]
    pub thumbs_bucket: String,
    pub s3_endpoint_url: Option<String>,
    pub s3_region: Option<String>,

    // External binaries
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    #[serde(default = "default_downloader_path")]
    pub downloader_path: String,

    // Transcription provider
    pub transcriber_url: Option<String>,
    pub transcriber_api_key: Option<String>,

    // Publisher API bases (overridable for tests)
    #[serde(default = "default_tiktok_api_base")]
    pub tiktok_api_base: String,
    #[serde(default = "default_youtube_api_base")]
    pub youtube_api_base: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,

    // Step timeouts
    #[serde(default = "default_render_timeout")]
    pub render_timeout_secs: u64,
    #[serde(default = "default_thumb_timeout")]
    pub thumb_timeout_secs: u64,
    #[serde(default = "default_transcode_timeout")]
    pub transcode_timeout_secs: u64,
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    // Cleanup
    #[serde(default = "default_retention_days")]
    pub cleanup_retention_days: i64,

    // Temp files
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,

    // Metrics server
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_stale_threshold() -> u64 {
    900 // 15 minutes
}

fn default_recovery_interval() -> u64 {
    300 // 5 minutes
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_claim_poll_min_ms() -> u64 {
    200
}

fn default_claim_poll_max_ms() -> u64 {
    5000
}

fn default_retry_base_ms() -> u64 {
    2000
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_retry_max_ms() -> u64 {
    60_000
}

fn default_videos_bucket() -> String {
    "videos".to_string()
}

fn default_transcripts_bucket() -> String {
    "transcripts".to_string()
}

fn default_renders_bucket() -> String {
    "renders".to_string()
}

fn default_thumbs_bucket() -> String {
    "thumbs".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_downloader_path() -> String {
    "yt-dlp".to_string()
}

fn default_tiktok_api_base() -> String {
    "https://open.tiktokapis.com".to_string()
}

fn default_youtube_api_base() -> String {
    "https://www.googleapis.com".to_string()
}

fn default_token_endpoint() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_render_timeout() -> u64 {
    600 // 10 minutes
}

fn default_thumb_timeout() -> u64 {
    120
}

fn default_transcode_timeout() -> u64 {
    300
}

fn default_upload_timeout() -> u64 {
    600
}

fn default_http_timeout() -> u64 {
    30
}

fn default_retention_days() -> i64 {
    30
}

fn default_temp_root() -> PathBuf {
    PathBuf::from("./data/tmp")
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_enabled() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        // Recovery must never requeue a job whose worker is still heartbeating.
        if self.stale_threshold_secs < self.heartbeat_interval_secs * 3 {
            anyhow::bail!(
                "stale_threshold_secs ({}) must be at least 3x heartbeat_interval_secs ({})",
                self.stale_threshold_secs,
                self.heartbeat_interval_secs
            );
        }
        if self.retry_factor < 1.0 {
            anyhow::bail!("retry_factor must be >= 1.0");
        }
        if self.claim_poll_min_ms == 0 || self.claim_poll_min_ms > self.claim_poll_max_ms {
            anyhow::bail!("claim poll window must satisfy 0 < min <= max");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn worker_slot_count(&self) -> usize {
        self.worker_slots.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get().min(4))
                .unwrap_or(2)
        })
    }

    /// Parses the optional kind filter into job kinds.
    pub fn kind_filter(&self) -> Option<Vec<crate::models::JobKind>> {
        let raw = self.worker_kinds.as_deref()?;
        let kinds: Vec<crate::models::JobKind> = raw
            .split(',')
            .filter_map(|name| serde_json::from_value(serde_json::json!(name.trim())).ok())
            .collect();
        if kinds.is_empty() {
            None
        } else {
            Some(kinds)
        }
    }

    pub fn has_database(&self) -> bool {
        self.database_url.is_some()
    }

    pub fn has_transcriber(&self) -> bool {
        self.transcriber_url.is_some()
    }
}
