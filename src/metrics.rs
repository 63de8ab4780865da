//! Prometheus metrics for the worker runtime
//!
//! Counters and histograms around the claim/finalize loop, served from a
//! small hyper endpoint at /metrics.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};

static JOBS_CLAIMED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "worker_jobs_claimed_total",
        "Jobs claimed by this worker, by kind",
        &["kind"]
    )
    .expect("Failed to create jobs_claimed metric")
});

static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "worker_jobs_finished_total",
        "Finalized jobs by kind and outcome",
        &["kind", "outcome"]
    )
    .expect("Failed to create jobs_finished metric")
});

static HANDLER_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 180.0, 600.0];
    register_histogram_vec!(
        prometheus::HistogramOpts::new(
            "worker_handler_duration_seconds",
            "Wall-clock handler duration by kind"
        )
        .buckets(buckets),
        &["kind"]
    )
    .expect("Failed to create handler_duration metric")
});

static JOBS_RECOVERED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "worker_jobs_recovered_total",
        "Stuck jobs requeued by the recovery ticker"
    )
    .expect("Failed to create jobs_recovered metric")
});

static ACTIVE_JOBS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "worker_active_jobs",
        "Jobs currently executing in this process"
    )
    .expect("Failed to create active_jobs metric")
});

pub fn record_job_claimed(kind: &str) {
    JOBS_CLAIMED.with_label_values(&[kind]).inc();
    ACTIVE_JOBS.inc();
}

pub fn record_job_finished(kind: &str, outcome: &str, elapsed: Duration) {
    JOBS_FINISHED.with_label_values(&[kind, outcome]).inc();
    HANDLER_DURATION
        .with_label_values(&[kind])
        .observe(elapsed.as_secs_f64());
    ACTIVE_JOBS.dec();
}

pub fn record_recovered_jobs(count: u64) {
    JOBS_RECOVERED.inc_by(count);
}

/// Renders the default registry in the text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Serves GET /metrics until the process exits.
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                let response = if req.uri().path() == "/metrics" {
                    Response::new(Full::new(Bytes::from(gather())))
                } else {
                    Response::builder()
                        .status(404)
                        .body(Full::new(Bytes::from("not found")))
                        .expect("static response")
                };
                Ok::<_, std::convert::Infallible>(response)
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                error!(error = %e, "Metrics connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_record_and_gather() {
        record_job_claimed("CLIP_RENDER");
        record_job_finished("CLIP_RENDER", "succeeded", Duration::from_millis(120));
        record_recovered_jobs(2);

        let text = gather();
        assert!(text.contains("worker_jobs_claimed_total"));
        assert!(text.contains("worker_jobs_finished_total"));
        assert!(text.contains("worker_jobs_recovered_total"));
    }
}
