//! Workspace usage counters, subscriptions, and rate-limit buckets

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metered usage dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMetric {
    Clips,
    SourceMinutes,
    Posts,
    /// Render completions; tracked for reporting, not capped by any plan.
    Renders,
}

impl UsageMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageMetric::Clips => "clips",
            UsageMetric::SourceMinutes => "source_minutes",
            UsageMetric::Posts => "posts",
            UsageMetric::Renders => "renders",
        }
    }
}

impl std::fmt::Display for UsageMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic increment applied to the open usage row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageDelta {
    pub clips: i64,
    pub source_minutes: i64,
    pub posts: i64,
    pub renders: i64,
}

impl UsageDelta {
    pub fn of(metric: UsageMetric, amount: i64) -> Self {
        let mut delta = Self::default();
        match metric {
            UsageMetric::Clips => delta.clips = amount,
            UsageMetric::SourceMinutes => delta.source_minutes = amount,
            UsageMetric::Posts => delta.posts = amount,
            UsageMetric::Renders => delta.renders = amount,
        }
        delta
    }
}

/// Monthly counters per workspace. Exactly one open row (period_end NULL)
/// per workspace per month.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkspaceUsage {
    pub workspace_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: Option<DateTime<Utc>>,
    pub clips_count: i64,
    pub source_minutes: i64,
    pub posts: i64,
    pub renders: i64,
    pub updated_at: DateTime<Utc>,
}

impl WorkspaceUsage {
    pub fn get(&self, metric: UsageMetric) -> i64 {
        match metric {
            UsageMetric::Clips => self.clips_count,
            UsageMetric::SourceMinutes => self.source_minutes,
            UsageMetric::Posts => self.posts,
            UsageMetric::Renders => self.renders,
        }
    }

    /// Zeroed counters for a fresh billing month.
    pub fn open(workspace_id: Uuid, period_start: DateTime<Utc>) -> Self {
        Self {
            workspace_id,
            period_start,
            period_end: None,
            clips_count: 0,
            source_minutes: 0,
            posts: 0,
            renders: 0,
            updated_at: period_start,
        }
    }
}

/// First instant of the month containing `at`, the open-usage period key.
pub fn month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(at)
}

/// Billing subscription as the plan resolver sees it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub plan: String,
    pub status: String,
    pub current_period_end: DateTime<Utc>,
}

impl Subscription {
    /// Active or trialing subscriptions participate in plan resolution.
    pub fn is_current(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }
}

/// Token bucket per (workspace, feature).
///
/// Buckets are seeded at plan capacity and treated as read-only
/// configuration by the posting guard; no refill policy is applied yet.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RateLimitBucket {
    pub workspace_id: Uuid,
    pub feature: String,
    pub capacity: i64,
    pub refill_rate: f64,
    pub tokens: f64,
    pub last_refill_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_start() {
        let at = Utc.with_ymd_and_hms(2025, 3, 17, 14, 30, 5).unwrap();
        let start = month_start(at);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_usage_delta_of() {
        let delta = UsageDelta::of(UsageMetric::Posts, 2);
        assert_eq!(delta.posts, 2);
        assert_eq!(delta.clips, 0);
    }

    #[test]
    fn test_subscription_currency() {
        let now = Utc::now();
        let sub = |status: &str| Subscription {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            plan: "pro".into(),
            status: status.into(),
            current_period_end: now,
        };
        assert!(sub("active").is_current());
        assert!(sub("trialing").is_current());
        assert!(!sub("canceled").is_current());
    }
}
