//! Retry backoff
//!
//! Two flavors live here:
//! - the deterministic per-job retry schedule used by the queue engine, and
//! - the jittered idle-poll backoff a worker slot uses when no job is
//!   eligible, so an empty queue is not spun on.

use std::time::Duration;

use rand::Rng;

/// Default base delay between retries.
pub const DEFAULT_BASE: Duration = Duration::from_secs(2);
/// Default multiplier applied per attempt.
pub const DEFAULT_FACTOR: f64 = 2.0;
/// Default delay cap.
pub const DEFAULT_MAX: Duration = Duration::from_secs(60);

/// Computes the delay before retry number `attempts`.
///
/// `delay = min(base * factor^(attempts - 1), max)`, with `attempts` coerced
/// to at least 1. Deterministic: the same inputs always produce the same
/// schedule, which keeps `run_at` reproducible across workers.
pub fn retry_delay(attempts: u32, base: Duration, factor: f64, max: Duration) -> Duration {
    let attempts = attempts.max(1);
    let exp = factor.powi(attempts as i32 - 1);
    let millis = (base.as_millis() as f64 * exp).min(max.as_millis() as f64);
    Duration::from_millis(millis as u64)
}

/// Retry delay with the standard queue defaults (2s base, x2, 60s cap).
pub fn default_retry_delay(attempts: u32) -> Duration {
    retry_delay(attempts, DEFAULT_BASE, DEFAULT_FACTOR, DEFAULT_MAX)
}

/// Capped exponential backoff for idle claim polling.
///
/// Starts near `min` and doubles up to `max` while the queue stays empty;
/// `reset` drops back to the floor once a job is claimed. Jitter spreads
/// concurrent workers so they do not poll in lockstep.
#[derive(Debug)]
pub struct PollBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Default idle polling window: 200ms floor, 5s ceiling.
    pub fn for_claim_loop() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5))
    }

    /// Returns the next sleep interval and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let delay = Duration::from_millis((self.current.as_millis() as f64 * jitter) as u64);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Resets to the floor after a successful claim.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_schedule() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_millis(60_000);
        assert_eq!(retry_delay(1, base, 2.0, max), Duration::from_millis(1000));
        assert_eq!(retry_delay(2, base, 2.0, max), Duration::from_millis(2000));
        assert_eq!(retry_delay(3, base, 2.0, max), Duration::from_millis(4000));
        assert_eq!(retry_delay(20, base, 2.0, max), Duration::from_millis(60_000));
    }

    #[test]
    fn test_retry_delay_coerces_zero_attempts() {
        let base = Duration::from_secs(2);
        assert_eq!(retry_delay(0, base, 2.0, DEFAULT_MAX), base);
    }

    #[test]
    fn test_retry_delay_monotone_up_to_cap() {
        let mut prev = Duration::ZERO;
        for n in 1..30 {
            let d = default_retry_delay(n);
            assert!(d >= prev, "delay regressed at attempt {}", n);
            assert!(d <= DEFAULT_MAX);
            prev = d;
        }
    }

    #[test]
    fn test_default_schedule_endpoints() {
        assert_eq!(default_retry_delay(1), DEFAULT_BASE);
        assert_eq!(default_retry_delay(100), DEFAULT_MAX);
    }

    #[test]
    fn test_poll_backoff_caps_and_resets() {
        let mut backoff = PollBackoff::new(Duration::from_millis(200), Duration::from_secs(5));
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = backoff.next_delay();
        }
        // Jitter is at most 1.2x the 5s ceiling.
        assert!(last <= Duration::from_secs(6));
        assert!(last >= Duration::from_secs(4));

        backoff.reset();
        let first = backoff.next_delay();
        assert!(first < Duration::from_millis(300));
    }
}
