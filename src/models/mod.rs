//! Persistent data model
//!
//! Row types for the tables the worker runtime operates on, plus the
//! validated per-kind job payloads. All ids are UUIDs; non-UUID ids fail at
//! the decode boundary.

pub mod clip;
pub mod job;
pub mod payload;
pub mod project;
pub mod publish;
pub mod usage;

pub use clip::{Clip, ClipStatus, NewClip};
pub use job::{Job, JobKind, JobState};
pub use payload::{
    CleanupStoragePayload, ClipRenderPayload, HighlightDetectPayload, IngestUrlPayload,
    PublishTiktokPayload, PublishYoutubePayload, ThumbnailGenPayload, TranscribePayload,
};
pub use project::{Project, ProjectStatus};
pub use publish::{ConnectedAccount, Platform, VariantPost, VariantPostStatus};
pub use usage::{RateLimitBucket, Subscription, UsageDelta, UsageMetric, WorkspaceUsage};
