//! Billing plans and their limits
//!
//! The active or trialing subscription with the latest period end defines
//! the workspace plan; anything missing or unrecognized falls back to basic.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{Subscription, UsageMetric};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    #[default]
    Basic,
    Pro,
    Premium,
}

/// Static caps per plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub clips_per_month: i64,
    pub source_minutes_per_month: i64,
    pub posts_per_month: i64,
    pub clips_per_project: u32,
    pub concurrent_jobs: u32,
    /// Minimum spacing between posts from one connected account.
    pub post_cooldown: Duration,
    pub posts_per_hour: u32,
    pub posts_per_day: u32,
}

const BASIC_LIMITS: PlanLimits = PlanLimits {
    clips_per_month: 450,
    source_minutes_per_month: 300,
    posts_per_month: 30,
    clips_per_project: 3,
    concurrent_jobs: 2,
    post_cooldown: Duration::from_secs(15 * 60),
    posts_per_hour: 2,
    posts_per_day: 8,
};

const PRO_LIMITS: PlanLimits = PlanLimits {
    clips_per_month: 1500,
    source_minutes_per_month: 1200,
    posts_per_month: 150,
    clips_per_project: 10,
    concurrent_jobs: 4,
    post_cooldown: Duration::from_secs(5 * 60),
    posts_per_hour: 6,
    posts_per_day: 30,
};

const PREMIUM_LIMITS: PlanLimits = PlanLimits {
    clips_per_month: 4500,
    source_minutes_per_month: 6000,
    posts_per_month: 600,
    clips_per_project: 30,
    concurrent_jobs: 8,
    post_cooldown: Duration::from_secs(2 * 60),
    posts_per_hour: 12,
    posts_per_day: 60,
};

impl Plan {
    pub fn limits(self) -> PlanLimits {
        match self {
            Plan::Basic => BASIC_LIMITS,
            Plan::Pro => PRO_LIMITS,
            Plan::Premium => PREMIUM_LIMITS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Basic => "basic",
            Plan::Pro => "pro",
            Plan::Premium => "premium",
        }
    }

    /// Monthly cap for a metered dimension, when the plan caps it.
    pub fn monthly_cap(self, metric: UsageMetric) -> Option<i64> {
        let limits = self.limits();
        match metric {
            UsageMetric::Clips => Some(limits.clips_per_month),
            UsageMetric::SourceMinutes => Some(limits.source_minutes_per_month),
            UsageMetric::Posts => Some(limits.posts_per_month),
            UsageMetric::Renders => None,
        }
    }

    fn parse(raw: &str) -> Option<Plan> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "basic" => Some(Plan::Basic),
            "pro" => Some(Plan::Pro),
            "premium" => Some(Plan::Premium),
            _ => None,
        }
    }

    /// Resolves the workspace plan from its subscriptions.
    ///
    /// The current (active/trialing) subscription with the latest
    /// `current_period_end` wins; missing or unrecognized plans resolve to
    /// basic.
    pub fn resolve(subscriptions: &[Subscription]) -> Plan {
        subscriptions
            .iter()
            .filter(|s| s.is_current())
            .max_by_key(|s| s.current_period_end)
            .and_then(|s| Plan::parse(&s.plan))
            .unwrap_or(Plan::Basic)
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    fn sub(plan: &str, status: &str, period_end_days: i64) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            plan: plan.into(),
            status: status.into(),
            current_period_end: Utc::now() + ChronoDuration::days(period_end_days),
        }
    }

    #[test]
    fn test_resolve_empty_is_basic() {
        assert_eq!(Plan::resolve(&[]), Plan::Basic);
    }

    #[test]
    fn test_resolve_prefers_latest_period_end() {
        let subs = vec![sub("pro", "active", 5), sub("premium", "active", 30)];
        assert_eq!(Plan::resolve(&subs), Plan::Premium);
    }

    #[test]
    fn test_resolve_ignores_expired_statuses() {
        let subs = vec![sub("premium", "canceled", 30), sub("pro", "trialing", 5)];
        assert_eq!(Plan::resolve(&subs), Plan::Pro);
    }

    #[test]
    fn test_resolve_unknown_plan_is_basic() {
        let subs = vec![sub("enterprise", "active", 30)];
        assert_eq!(Plan::resolve(&subs), Plan::Basic);
    }

    #[test]
    fn test_caps() {
        assert_eq!(Plan::Basic.monthly_cap(UsageMetric::Clips), Some(450));
        assert_eq!(Plan::Basic.limits().clips_per_project, 3);
        assert_eq!(Plan::Premium.monthly_cap(UsageMetric::Renders), None);
    }
}
