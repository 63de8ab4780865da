//! Admission controls
//!
//! Pre-work checks that reject jobs fast, before any expensive resource is
//! consumed: monthly usage caps, and the posting-rate guard for publish
//! handlers. Usage failures are fatal (dead-letter, so operators see them);
//! posting-guard failures are retryable at the exact time the window
//! reopens.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{Result, WorkerError};
use crate::models::{usage::month_start, Platform, UsageDelta, UsageMetric};
use crate::plan::{Plan, PlanLimits};
use crate::store::Store;

/// Hours of posting history consulted by the rate guard.
const POST_HISTORY_HOURS: i64 = 24;

pub struct Admission {
    store: Arc<dyn Store>,
    clock: SharedClock,
}

impl Admission {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Resolves the workspace plan from its subscriptions.
    pub async fn resolve_plan(&self, workspace_id: Uuid) -> Result<Plan> {
        let subscriptions = self.store.list_subscriptions(workspace_id).await?;
        Ok(Plan::resolve(&subscriptions))
    }

    /// Asserts the open month can absorb `requested` more units of `metric`.
    pub async fn assert_within_usage(
        &self,
        workspace_id: Uuid,
        metric: UsageMetric,
        requested: i64,
    ) -> Result<()> {
        let plan = self.resolve_plan(workspace_id).await?;
        let Some(limit) = plan.monthly_cap(metric) else {
            return Ok(());
        };

        let period = month_start(self.clock.now());
        let usage = self.store.get_open_usage(workspace_id, period).await?;
        let used = usage.get(metric);

        if used + requested > limit {
            return Err(WorkerError::UsageLimitExceeded {
                metric: metric.to_string(),
                used,
                limit,
            });
        }
        debug!(
            workspace_id = %workspace_id,
            metric = %metric,
            used,
            requested,
            limit,
            plan = %plan,
            "Usage check passed"
        );
        Ok(())
    }

    /// Records consumed usage after the side effect succeeded.
    pub async fn record_usage(
        &self,
        workspace_id: Uuid,
        metric: UsageMetric,
        amount: i64,
    ) -> Result<()> {
        if amount <= 0 {
            return Ok(());
        }
        let now = self.clock.now();
        self.store
            .increment_usage(
                workspace_id,
                month_start(now),
                UsageDelta::of(metric, amount),
                now,
            )
            .await
    }

    /// Posting-rate guard for one connected account.
    ///
    /// History is the last 24 hours of posted variant-posts for the
    /// account/platform; limits come from the workspace plan.
    pub async fn enforce_post_limits(
        &self,
        workspace_id: Uuid,
        connected_account_id: Uuid,
        platform: Platform,
    ) -> Result<()> {
        let now = self.clock.now();
        let since = now - ChronoDuration::hours(POST_HISTORY_HOURS);
        let history: Vec<DateTime<Utc>> = self
            .store
            .list_recent_posts(connected_account_id, platform, since)
            .await?
            .into_iter()
            .filter_map(|p| p.posted_at)
            .collect();
        let plan = self.resolve_plan(workspace_id).await?;
        check_post_windows(now, &history, &plan.limits())
    }
}

/// Pure window check: cooldown since the last post, hourly cap, daily cap.
pub fn check_post_windows(
    now: DateTime<Utc>,
    history: &[DateTime<Utc>],
    limits: &PlanLimits,
) -> Result<()> {
    let cooldown =
        ChronoDuration::from_std(limits.post_cooldown).unwrap_or_else(|_| ChronoDuration::zero());

    if let Some(latest) = history.iter().max() {
        let reopen = *latest + cooldown;
        if reopen > now {
            return Err(WorkerError::PostingLimitExceeded {
                reason: "account cooldown".into(),
                remaining_ms: (reopen - now).num_milliseconds(),
            });
        }
    }

    let window_violation = |window: ChronoDuration, cap: u32, reason: &str| -> Result<()> {
        let cutoff = now - window;
        let mut in_window: Vec<&DateTime<Utc>> =
            history.iter().filter(|at| **at >= cutoff).collect();
        if in_window.len() < cap as usize {
            return Ok(());
        }
        // Window reopens when the oldest post inside it ages out.
        in_window.sort();
        let oldest = **in_window.first().expect("non-empty by cap check");
        let reopen = oldest + window;
        Err(WorkerError::PostingLimitExceeded {
            reason: reason.into(),
            remaining_ms: (reopen - now).num_milliseconds().max(0),
        })
    };

    window_violation(ChronoDuration::hours(1), limits.posts_per_hour, "hourly cap")?;
    window_violation(ChronoDuration::hours(24), limits.posts_per_day, "daily cap")?;
    Ok(())
}
