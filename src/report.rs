//! Error reporter port
//!
//! Unexpected failures get shipped somewhere operators watch. Production
//! deployments can plug a real sink; the default forwards to tracing.

use crate::error::WorkerError;
use crate::models::Job;

pub trait ErrorReporter: Send + Sync {
    fn report(&self, job: &Job, error: &WorkerError);
}

/// Default reporter: structured error logs.
#[derive(Debug, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, job: &Job, error: &WorkerError) {
        tracing::error!(
            job_id = %job.id,
            workspace_id = %job.workspace_id,
            kind = %job.kind,
            attempt = job.attempts,
            error_kind = error.kind(),
            error = %error,
            "Handler error reported"
        );
    }
}
