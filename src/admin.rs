//! Admin operations
//!
//! One-shot operational commands: DLQ requeue, stuck-job recovery, and
//! rate-limit seeding from current subscriptions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::Result;
use crate::models::{RateLimitBucket, Subscription};
use crate::plan::Plan;
use crate::queue::QueueEngine;
use crate::store::Store;

/// Requeues a dead-letter job. Fails with `Conflict` when the job is not
/// currently dead-lettered.
pub async fn requeue_dead_letter(queue: &QueueEngine, job_id: Uuid) -> Result<()> {
    let job = queue.requeue_dead_letter(job_id).await?;
    info!(
        job_id = %job.id,
        kind = %job.kind,
        last_error = ?job.last_error,
        "Dead-letter job requeued"
    );
    Ok(())
}

/// One recovery pass; returns the number of jobs requeued.
pub async fn recover_stuck_jobs(queue: &QueueEngine, stale_after: Duration) -> Result<u64> {
    queue.recover_stuck(stale_after).await
}

/// Upserts one bucket per (workspace, feature) at current plan capacity.
pub async fn seed_rate_limits(store: &Arc<dyn Store>, clock: &SharedClock) -> Result<usize> {
    let subscriptions = store.list_current_subscriptions().await?;

    // Latest current subscription per workspace decides the plan.
    let mut per_workspace: HashMap<Uuid, Vec<Subscription>> = HashMap::new();
    for sub in subscriptions {
        per_workspace.entry(sub.workspace_id).or_default().push(sub);
    }

    let now = clock.now();
    let mut seeded = 0usize;
    for (workspace_id, subs) in per_workspace {
        let plan = Plan::resolve(&subs);
        let limits = plan.limits();
        let buckets = [
            ("posts.hourly", limits.posts_per_hour as i64),
            ("posts.daily", limits.posts_per_day as i64),
            ("clips.monthly", limits.clips_per_month),
        ];
        for (feature, capacity) in buckets {
            store
                .upsert_rate_limit(&RateLimitBucket {
                    workspace_id,
                    feature: feature.to_string(),
                    capacity,
                    refill_rate: 0.0,
                    tokens: capacity as f64,
                    last_refill_at: now,
                })
                .await?;
            seeded += 1;
        }
        info!(workspace_id = %workspace_id, plan = %plan, "Rate limits seeded");
    }
    Ok(seeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_seed_rate_limits_per_workspace_plan() {
        let store = Arc::new(MemoryStore::new());
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        let ws = Uuid::new_v4();

        store.seed_subscription(Subscription {
            id: Uuid::new_v4(),
            workspace_id: ws,
            plan: "pro".into(),
            status: "active".into(),
            current_period_end: Utc::now() + chrono::Duration::days(10),
        });
        store.seed_subscription(Subscription {
            id: Uuid::new_v4(),
            workspace_id: ws,
            plan: "basic".into(),
            status: "canceled".into(),
            current_period_end: Utc::now() + chrono::Duration::days(90),
        });

        let store_dyn: Arc<dyn Store> = store.clone();
        let seeded = seed_rate_limits(&store_dyn, &clock).await.unwrap();
        assert_eq!(seeded, 3);

        let bucket = store.rate_limit_snapshot(ws, "posts.daily").unwrap();
        assert_eq!(bucket.capacity, Plan::Pro.limits().posts_per_day as i64);
        assert_eq!(bucket.tokens, bucket.capacity as f64);
    }

    #[tokio::test]
    async fn test_seed_with_no_subscriptions_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        let store_dyn: Arc<dyn Store> = store;
        assert_eq!(seed_rate_limits(&store_dyn, &clock).await.unwrap(), 0);
    }
}
