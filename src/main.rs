//! Cliply worker entrypoint
//!
//! Subcommands:
//! - `run`: start the worker runtime (daemon)
//! - `ready`: one-shot readiness probe (JSON, exit 0/1)
//! - `recover-stuck`: requeue jobs with stale heartbeats
//! - `requeue <job-id>`: put a dead-letter job back in the queue
//! - `seed-rate-limits`: upsert rate-limit buckets from subscriptions
//! - `status`: job counts per kind and state

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use cliply_worker::admin;
use cliply_worker::admission::Admission;
use cliply_worker::blobstore::{Buckets, S3BlobStore};
use cliply_worker::clock::{SharedClock, SystemClock};
use cliply_worker::config::Config;
use cliply_worker::handlers::{StepTimeouts, WorkerContext};
use cliply_worker::media::{FfmpegTranscoder, HttpTranscriber, YtDlpDownloader};
use cliply_worker::publish::{OAuthTokenProvider, TikTokPublisher, YouTubePublisher};
use cliply_worker::queue::{QueueEngine, RetryPolicy};
use cliply_worker::readiness;
use cliply_worker::report::TracingErrorReporter;
use cliply_worker::store::{PostgresStore, Store};
use cliply_worker::worker::{WorkerOptions, WorkerRuntime};

/// Cliply Worker - durable job runtime for the media pipeline
#[derive(Parser, Debug)]
#[command(name = "cliply-worker")]
#[command(author = "Cliply Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Durable job runtime and media pipeline orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the worker runtime
    Run,

    /// One-shot readiness probe; prints JSON, exits 0/1
    Ready,

    /// Requeue running jobs whose heartbeat went silent
    RecoverStuck {
        /// Heartbeat age that counts as stuck, in seconds
        #[arg(long, env = "STALE_AFTER_SECONDS", default_value = "900")]
        stale_after_seconds: u64,
    },

    /// Requeue a dead-letter job by id
    Requeue {
        /// Job id
        job_id: Uuid,
    },

    /// Upsert rate-limit buckets for all current subscriptions
    SeedRateLimits,

    /// Show job counts per kind and state
    Status,
}

/// Sets up structured logging with tracing
fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

/// Handles graceful shutdown on SIGTERM/SIGINT
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }

    let _ = shutdown_tx.send(());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.json_logs);

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Commands::Run => run_worker(config).await?,
        Commands::Ready => {
            let report = readiness::check(&config).await;
            println!("{}", report.to_json());
            if !report.ok {
                std::process::exit(1);
            }
        }
        Commands::RecoverStuck {
            stale_after_seconds,
        } => {
            let (queue, _store) = connect_queue(&config).await?;
            let recovered = admin::recover_stuck_jobs(
                &queue,
                Duration::from_secs(stale_after_seconds),
            )
            .await?;
            info!(recovered, stale_after_seconds, "Stuck-job recovery complete");
            println!("{}", recovered);
        }
        Commands::Requeue { job_id } => {
            let (queue, _store) = connect_queue(&config).await?;
            admin::requeue_dead_letter(&queue, job_id).await?;
            println!("requeued {}", job_id);
        }
        Commands::SeedRateLimits => {
            let (_queue, store) = connect_queue(&config).await?;
            let clock: SharedClock = Arc::new(SystemClock);
            let seeded = admin::seed_rate_limits(&store, &clock).await?;
            info!(seeded, "Rate-limit buckets seeded");
            println!("seeded {} buckets", seeded);
        }
        Commands::Status => {
            let (_queue, store) = connect_queue(&config).await?;
            let counts = store.count_jobs().await?;
            println!("{:<20} {:<12} {:>8}", "KIND", "STATE", "COUNT");
            println!("{}", "-".repeat(42));
            for row in counts {
                println!(
                    "{:<20} {:<12} {:>8}",
                    row.kind.as_str(),
                    row.state.as_str(),
                    row.count
                );
            }
        }
    }

    Ok(())
}

async fn connect_queue(config: &Config) -> Result<(QueueEngine, Arc<dyn Store>)> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
    let store: Arc<dyn Store> = Arc::new(PostgresStore::connect(url).await?);
    let clock: SharedClock = Arc::new(SystemClock);
    let queue = QueueEngine::new(
        store.clone(),
        clock,
        RetryPolicy {
            base: config.retry_base(),
            factor: config.retry_factor,
            max: config.retry_max(),
        },
    );
    Ok((queue, store))
}

async fn build_context(config: &Config) -> Result<Arc<WorkerContext>> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
    let transcriber_url = config
        .transcriber_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("TRANSCRIBER_URL is not set"))?;

    let store: Arc<dyn Store> = Arc::new(PostgresStore::connect(url).await?);
    let clock: SharedClock = Arc::new(SystemClock);
    let queue = Arc::new(QueueEngine::new(
        store.clone(),
        clock.clone(),
        RetryPolicy {
            base: config.retry_base(),
            factor: config.retry_factor,
            max: config.retry_max(),
        },
    ));
    let admission = Arc::new(Admission::new(store.clone(), clock.clone()));

    let blobs = Arc::new(
        S3BlobStore::from_env(
            config.s3_endpoint_url.as_deref(),
            config.s3_region.as_deref(),
        )
        .await?,
    );

    let http_timeout = Duration::from_secs(config.http_timeout_secs);
    let upload_timeout = Duration::from_secs(config.upload_timeout_secs);

    let context = WorkerContext {
        store: store.clone(),
        blobs,
        buckets: Buckets::from_config(config),
        queue,
        clock: clock.clone(),
        admission,
        downloader: Arc::new(YtDlpDownloader::new(
            config.downloader_path.clone(),
            Duration::from_secs(config.transcode_timeout_secs.max(600)),
        )),
        transcoder: Arc::new(FfmpegTranscoder::new(
            config.ffmpeg_path.clone(),
            config.ffprobe_path.clone(),
        )),
        transcriber: Arc::new(HttpTranscriber::new(
            transcriber_url,
            config.transcriber_api_key.clone(),
            upload_timeout,
        )?),
        token_provider: Arc::new(OAuthTokenProvider::new(
            config.token_endpoint.clone(),
            store,
            clock,
            http_timeout,
        )?),
        tiktok: Arc::new(TikTokPublisher::new(
            config.tiktok_api_base.clone(),
            upload_timeout,
        )?),
        youtube: Arc::new(YouTubePublisher::new(
            config.youtube_api_base.clone(),
            upload_timeout,
        )?),
        reporter: Arc::new(TracingErrorReporter),
        temp_root: config.temp_root.clone(),
        timeouts: StepTimeouts {
            render: Duration::from_secs(config.render_timeout_secs),
            thumbnail: Duration::from_secs(config.thumb_timeout_secs),
            transcode: Duration::from_secs(config.transcode_timeout_secs),
            upload: upload_timeout,
            http: http_timeout,
        },
        default_retention_days: config.cleanup_retention_days,
    };
    Ok(Arc::new(context))
}

async fn run_worker(config: Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        slots = config.worker_slot_count(),
        "Starting Cliply worker"
    );

    // Bootstrap: refuse to start without the external tools the pipeline
    // shells out to.
    let missing = readiness::verify_binaries(&config).await;
    if !missing.is_empty() {
        anyhow::bail!("bootstrap failed: {}", missing.join(", "));
    }

    let ctx = build_context(&config).await?;
    let options = WorkerOptions::from_config(&config);
    let runtime = WorkerRuntime::new(ctx, options);

    if config.metrics_enabled {
        let addr: SocketAddr = format!("0.0.0.0:{}", config.metrics_port).parse()?;
        tokio::spawn(async move {
            if let Err(e) = cliply_worker::metrics::start_metrics_server(addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    tokio::spawn(shutdown_signal(shutdown_tx.clone()));

    runtime.run(shutdown_tx).await;
    info!("Cliply worker stopped");
    Ok(())
}
