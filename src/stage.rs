//! Project pipeline stages
//!
//! A project only ever moves forward along this order. Writes go through
//! conditional updates (compare-and-set on the current stage), which makes
//! every handler idempotent with respect to stage progression and safe
//! against concurrent workers racing on the same project.

use serde::{Deserialize, Serialize};

/// Ordered pipeline stages: `Uploaded < Transcribed < ClipsGenerated <
/// Rendered < Published`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "pipeline_stage", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Uploaded,
    Transcribed,
    ClipsGenerated,
    Rendered,
    Published,
}

impl PipelineStage {
    pub const ALL: &'static [PipelineStage] = &[
        PipelineStage::Uploaded,
        PipelineStage::Transcribed,
        PipelineStage::ClipsGenerated,
        PipelineStage::Rendered,
        PipelineStage::Published,
    ];

    /// Whether the current stage has reached (or passed) `target`.
    pub fn is_at_least(self, target: PipelineStage) -> bool {
        self >= target
    }

    /// The stage that follows this one, if any.
    pub fn next_after(self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Uploaded => Some(PipelineStage::Transcribed),
            PipelineStage::Transcribed => Some(PipelineStage::ClipsGenerated),
            PipelineStage::ClipsGenerated => Some(PipelineStage::Rendered),
            PipelineStage::Rendered => Some(PipelineStage::Published),
            PipelineStage::Published => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Uploaded => "UPLOADED",
            PipelineStage::Transcribed => "TRANSCRIBED",
            PipelineStage::ClipsGenerated => "CLIPS_GENERATED",
            PipelineStage::Rendered => "RENDERED",
            PipelineStage::Published => "PUBLISHED",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
