//! Publishing records: connected accounts and per-variant post rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// External platforms clips are published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "platform", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Tiktok,
    Youtube,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Tiktok => "tiktok",
            Platform::Youtube => "youtube",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An externally linked identity with token references.
///
/// Token columns hold references into the encrypted token store, never the
/// raw secrets.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConnectedAccount {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub platform: Platform,
    pub external_id: String,
    pub access_token_ref: String,
    pub refresh_token_ref: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "variant_post_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VariantPostStatus {
    Pending,
    Posted,
    Failed,
}

impl VariantPostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VariantPostStatus::Pending => "pending",
            VariantPostStatus::Posted => "posted",
            VariantPostStatus::Failed => "failed",
        }
    }
}

/// One clip published to one connected account on one platform, optionally
/// under an experiment variant. At most one `posted` row may exist per
/// `(clip_id, connected_account_id, platform)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VariantPost {
    pub id: Uuid,
    pub clip_id: Uuid,
    pub connected_account_id: Uuid,
    pub platform: Platform,
    pub variant_id: Option<String>,
    pub status: VariantPostStatus,
    pub platform_post_id: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
