//! Cliply Worker
//! Durable job runtime and pipeline orchestrator for the Cliply media
//! backend (ingest → transcribe → highlight-detect → render → publish).
//!
//! Features:
//! - Durable claim/heartbeat/retry/dead-letter queue over Postgres
//! - Monotonic per-project stage machine with CAS guards
//! - Idempotent handlers: deterministic artifact keys, create-if-absent
//!   uploads, deduped clip insertion, variant-post publish records
//! - Usage quotas and posting-rate admission checks per workspace plan
//! - Worker pool with heartbeat pumps, stuck-job recovery, graceful drain
//! - Prometheus metrics and a one-shot readiness probe

pub mod admin;
pub mod admission;
pub mod backoff;
pub mod blobstore;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod media;
pub mod metrics;
pub mod models;
pub mod plan;
pub mod publish;
pub mod queue;
pub mod readiness;
pub mod report;
pub mod stage;
pub mod store;
pub mod tempfiles;
pub mod worker;
