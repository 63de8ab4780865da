//! Queue engine
//!
//! The durable claim protocol over the store: enqueue, finalize
//! (complete / retry / dead-letter), stuck-job recovery, and admin DLQ
//! requeue. Claiming itself is a single store call; this module owns the
//! policy around it.
//!
//! Job state machine:
//!
//! ```text
//! queued  --claim-->  running
//! running --complete--> succeeded                                (terminal)
//! running --fail(retryable, attempts<max)--> queued              (run_at += backoff)
//! running --fail(non-retryable or attempts=max)--> dead_letter   (terminal)
//! dead_letter --admin requeue--> queued                          (attempts := 0)
//! running --heartbeat stale + recovery tick--> queued
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backoff::retry_delay;
use crate::clock::SharedClock;
use crate::error::{Result, WorkerError};
use crate::models::{Job, JobKind, JobState};
use crate::store::Store;

/// Retry schedule parameters, taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: crate::backoff::DEFAULT_BASE,
            factor: crate::backoff::DEFAULT_FACTOR,
            max: crate::backoff::DEFAULT_MAX,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempts: u32) -> Duration {
        retry_delay(attempts, self.base, self.factor, self.max)
    }
}

/// How a finished job left the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Retried { run_at: DateTime<Utc> },
    DeadLettered,
}

pub struct QueueEngine {
    store: Arc<dyn Store>,
    clock: SharedClock,
    retry: RetryPolicy,
}

impl QueueEngine {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Inserts a new queued job, optionally delayed.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        workspace_id: Uuid,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<Job> {
        let now = self.clock.now();
        let run_at = scheduled_for.unwrap_or(now);
        let mut job = Job::enqueue(workspace_id, kind, payload, run_at);
        job.created_at = now;
        job.updated_at = now;
        self.store.insert_job(&job).await?;
        info!(
            job_id = %job.id,
            kind = %kind,
            workspace_id = %workspace_id,
            run_at = %run_at,
            "Job enqueued"
        );
        Ok(job)
    }

    /// Claims one eligible job for this worker, if any.
    pub async fn claim(
        &self,
        worker_id: &str,
        kinds: Option<&[JobKind]>,
        workspace_id: Option<Uuid>,
    ) -> Result<Option<Job>> {
        self.store
            .claim_job(worker_id, kinds, workspace_id, self.clock.now())
            .await
    }

    /// Finalizes a claimed job from its handler result.
    pub async fn finalize(
        &self,
        job: &Job,
        result: std::result::Result<(), WorkerError>,
    ) -> Result<JobOutcome> {
        let now = self.clock.now();
        match result {
            Ok(()) => {
                self.store.complete_job(job.id, now).await?;
                Ok(JobOutcome::Succeeded)
            }
            Err(err) => self.fail(job, &err, now).await,
        }
    }

    async fn fail(&self, job: &Job, err: &WorkerError, now: DateTime<Utc>) -> Result<JobOutcome> {
        let message = err.to_string();
        let can_retry = err.retryable() && job.attempts < job.max_attempts;

        if can_retry {
            // Rate-guard errors carry the exact reopen time; everything else
            // follows the exponential schedule keyed on attempts so far.
            let delay = err
                .retry_after()
                .unwrap_or_else(|| self.retry.delay_for(job.attempts.max(1) as u32));
            let run_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
            self.store.retry_job(job.id, &message, run_at, now).await?;
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                error_kind = err.kind(),
                retry_at = %run_at,
                error = %message,
                "Job failed, scheduled for retry"
            );
            Ok(JobOutcome::Retried { run_at })
        } else {
            self.store.dead_letter_job(job.id, &message, now).await?;
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempts,
                error_kind = err.kind(),
                error = %message,
                "Job dead-lettered"
            );
            Ok(JobOutcome::DeadLettered)
        }
    }

    /// Requeues running jobs whose heartbeat is older than `stale_after`.
    pub async fn recover_stuck(&self, stale_after: Duration) -> Result<u64> {
        let now = self.clock.now();
        let stale_before = now
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::seconds(900));
        let recovered = self.store.recover_stuck_jobs(stale_before, now).await?;
        if recovered > 0 {
            info!(recovered, stale_after_secs = stale_after.as_secs(), "Recovered stuck jobs");
        }
        Ok(recovered)
    }

    /// Admin path: puts a dead-letter job back in the queue with a fresh
    /// attempt budget. Fails with `Conflict` when the job is not currently
    /// dead-lettered.
    pub async fn requeue_dead_letter(&self, job_id: Uuid) -> Result<Job> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(WorkerError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })?;

        if job.state != JobState::DeadLetter {
            return Err(WorkerError::Conflict(format!(
                "job {} is {}, not dead_letter",
                job_id, job.state
            )));
        }

        let requeued = self.store.requeue_dead_letter(job_id, self.clock.now()).await?;
        if !requeued {
            // State changed between the read and the conditional update.
            return Err(WorkerError::Conflict(format!(
                "job {} left dead_letter concurrently",
                job_id
            )));
        }

        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(WorkerError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })?;
        info!(job_id = %job_id, "Dead-letter job requeued");
        Ok(job)
    }
}
