//! Worker runtime
//!
//! A pool of claim slots over the queue engine. Each slot claims one job,
//! pumps heartbeats while the handler runs, and finalizes through the queue.
//! A recovery ticker requeues jobs whose workers died. Shutdown stops new
//! claims, drains in-flight handlers for a bounded time, then cancels the
//! stragglers (the recovery ticker picks up anything that ignores it).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::backoff::PollBackoff;
use crate::cancel::{CancelSource, CancelToken};
use crate::config::Config;
use crate::handlers::{dispatch, WorkerContext};
use crate::metrics;
use crate::models::{Job, JobKind};
use crate::queue::JobOutcome;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub slots: usize,
    pub kinds: Option<Vec<JobKind>>,
    pub heartbeat_interval: Duration,
    pub stale_threshold: Duration,
    pub recovery_interval: Duration,
    pub drain_timeout: Duration,
    pub claim_poll_min: Duration,
    pub claim_poll_max: Duration,
}

impl WorkerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            slots: config.worker_slot_count(),
            kinds: config.kind_filter(),
            heartbeat_interval: config.heartbeat_interval(),
            stale_threshold: config.stale_threshold(),
            recovery_interval: config.recovery_interval(),
            drain_timeout: config.drain_timeout(),
            claim_poll_min: Duration::from_millis(config.claim_poll_min_ms),
            claim_poll_max: Duration::from_millis(config.claim_poll_max_ms),
        }
    }
}

pub struct WorkerRuntime {
    ctx: Arc<WorkerContext>,
    options: WorkerOptions,
    worker_id: String,
}

impl WorkerRuntime {
    pub fn new(ctx: Arc<WorkerContext>, options: WorkerOptions) -> Self {
        let worker_id = format!("worker-{}", Uuid::new_v4());
        Self {
            ctx,
            options,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs until the shutdown channel fires, then drains.
    pub async fn run(self, shutdown_tx: broadcast::Sender<()>) {
        info!(
            worker_id = %self.worker_id,
            slots = self.options.slots,
            kinds = ?self.options.kinds,
            "Starting worker runtime"
        );

        let (cancel_source, cancel_token) = CancelSource::new();

        // Stuck-job recovery ticker; safe and idempotent on every worker.
        let recovery = self.spawn_recovery_ticker(shutdown_tx.subscribe());

        let mut slots: Vec<JoinHandle<()>> = Vec::with_capacity(self.options.slots);
        for slot_index in 0..self.options.slots {
            slots.push(self.spawn_slot(slot_index, shutdown_tx.subscribe(), cancel_token.clone()));
        }

        // Wait for shutdown.
        let mut shutdown_rx = shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;
        info!(worker_id = %self.worker_id, "Shutdown requested, draining in-flight jobs");

        // Bounded drain, then cancel whatever is still running.
        let deadline = tokio::time::Instant::now() + self.options.drain_timeout;
        while slots.iter().any(|slot| !slot.is_finished())
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if slots.iter().any(|slot| !slot.is_finished()) {
            warn!(
                worker_id = %self.worker_id,
                drain_timeout_secs = self.options.drain_timeout.as_secs(),
                "Drain timeout exceeded, cancelling in-flight handlers"
            );
            cancel_source.cancel();
        }
        for slot in slots {
            let _ = tokio::time::timeout(Duration::from_secs(5), slot).await;
        }

        recovery.abort();
        info!(worker_id = %self.worker_id, "Worker runtime stopped");
    }

    fn spawn_recovery_ticker(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let queue = self.ctx.queue.clone();
        let interval = self.options.recovery_interval;
        let stale_threshold = self.options.stale_threshold;
        let clock = self.ctx.clock.clone();

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = clock.sleep(interval) => {
                            match queue.recover_stuck(stale_threshold).await {
                                Ok(recovered) if recovered > 0 => {
                                    metrics::record_recovered_jobs(recovered);
                                }
                                Ok(_) => {}
                                Err(e) => error!(error = %e, "Stuck-job recovery failed"),
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }
            .instrument(tracing::info_span!("recovery_ticker")),
        )
    }

    fn spawn_slot(
        &self,
        slot_index: usize,
        mut shutdown_rx: broadcast::Receiver<()>,
        cancel_token: CancelToken,
    ) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let worker_id = self.worker_id.clone();
        let kinds = self.options.kinds.clone();
        let heartbeat_interval = self.options.heartbeat_interval;
        let mut backoff = PollBackoff::new(self.options.claim_poll_min, self.options.claim_poll_max);

        tokio::spawn(
            async move {
                loop {
                    // A pending shutdown stops new claims.
                    match shutdown_rx.try_recv() {
                        Err(broadcast::error::TryRecvError::Empty) => {}
                        _ => break,
                    }

                    let claimed = ctx
                        .queue
                        .claim(&worker_id, kinds.as_deref(), None)
                        .await;

                    match claimed {
                        Ok(Some(job)) => {
                            backoff.reset();
                            process_job(&ctx, &worker_id, job, heartbeat_interval, &cancel_token)
                                .await;
                        }
                        Ok(None) => {
                            // Nothing eligible: sleep, don't spin.
                            let delay = backoff.next_delay();
                            tokio::select! {
                                _ = ctx.clock.sleep(delay) => {}
                                _ = shutdown_rx.recv() => break,
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Claim failed");
                            let delay = backoff.next_delay();
                            tokio::select! {
                                _ = ctx.clock.sleep(delay) => {}
                                _ = shutdown_rx.recv() => break,
                            }
                        }
                    }
                }
                debug!(slot = slot_index, "Slot stopped");
            }
            .instrument(tracing::info_span!("slot", slot = slot_index)),
        )
    }
}

/// Runs one claimed job to completion: heartbeat pump, dispatch, finalize.
async fn process_job(
    ctx: &Arc<WorkerContext>,
    worker_id: &str,
    job: Job,
    heartbeat_interval: Duration,
    cancel_token: &CancelToken,
) {
    metrics::record_job_claimed(job.kind.as_str());
    let started = std::time::Instant::now();
    info!(
        job_id = %job.id,
        kind = %job.kind,
        workspace_id = %job.workspace_id,
        attempt = job.attempts,
        "Job claimed"
    );

    // Heartbeat pump: refresh until the handler returns or the row stops
    // being ours (another worker recovered it).
    let pump = {
        let store = ctx.store.clone();
        let clock = ctx.clock.clone();
        let job_id = job.id;
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            loop {
                clock.sleep(heartbeat_interval).await;
                match store.heartbeat_job(job_id, &worker_id, clock.now()).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %job_id, "Lost job ownership, stopping heartbeat");
                        break;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Heartbeat failed");
                    }
                }
            }
        })
    };

    let result = dispatch(&job, ctx, cancel_token).await;
    pump.abort();

    let error_message = result.as_ref().err().map(|e| e.to_string());
    if let Err(err) = &result {
        ctx.reporter.report(&job, err);
    }

    match ctx.queue.finalize(&job, result).await {
        Ok(outcome) => {
            let outcome_label = match &outcome {
                JobOutcome::Succeeded => "succeeded",
                JobOutcome::Retried { .. } => "retried",
                JobOutcome::DeadLettered => "dead_letter",
            };
            metrics::record_job_finished(job.kind.as_str(), outcome_label, started.elapsed());
            info!(
                job_id = %job.id,
                kind = %job.kind,
                outcome = outcome_label,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job finalized"
            );
            if outcome == JobOutcome::DeadLettered {
                mark_project_failed_if_fatal(ctx, &job, error_message.as_deref()).await;
            }
        }
        Err(e) => {
            // The job stays running; the recovery ticker will requeue it
            // once the heartbeat goes stale.
            error!(job_id = %job.id, error = %e, "Failed to finalize job");
        }
    }
}

/// A dead-letter on an early pipeline stage stops the whole project; mark
/// it failed so the UI stops showing it as in progress. Clip-level stages
/// (render, publish) leave the project alone and converge on mixed clip
/// statuses instead.
async fn mark_project_failed_if_fatal(
    ctx: &Arc<WorkerContext>,
    job: &Job,
    error_message: Option<&str>,
) {
    let fatal_stage = matches!(
        job.kind,
        JobKind::IngestUrl | JobKind::Transcribe | JobKind::HighlightDetect
    );
    if !fatal_stage {
        return;
    }
    let Some(project_id) = job
        .payload
        .get("projectId")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
    else {
        return;
    };
    if let Err(e) = ctx
        .store
        .set_project_status(
            project_id,
            crate::models::ProjectStatus::Failed,
            error_message,
            ctx.clock.now(),
        )
        .await
    {
        error!(project_id = %project_id, error = %e, "Failed to mark project failed");
    } else {
        warn!(project_id = %project_id, kind = %job.kind, "Project marked failed after dead-letter");
    }
}
