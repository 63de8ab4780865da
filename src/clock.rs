//! Clock port
//!
//! Every backoff, guard window, and cleanup cutoff in the system reads time
//! through this trait so tests can advance it deterministically.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time (UTC).
    fn now(&self) -> DateTime<Utc>;

    /// Suspends the calling task for the given duration.
    async fn sleep(&self, duration: Duration);
}

pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by the system time and the tokio timer.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test clock with manually advanced time.
///
/// `sleep` suspends until `advance` has moved the clock past the deadline,
/// so timing-sensitive code runs without real waiting.
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
    notify: tokio::sync::Notify,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Moves the clock forward and wakes all pending sleepers.
    pub fn advance(&self, duration: Duration) {
        {
            let mut now = self.now.lock();
            *now += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        }
        self.notify.notify_waiters();
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now()
            + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        while self.now() < deadline {
            self.notify.notified().await;
        }
    }
}
