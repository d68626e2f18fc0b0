//! Reconciliation primitives.
//!
//! The routing daemon applies events as they arrive and, independently, runs a
//! periodic reconciliation tick that lets deferred backend strategies catch up
//! (flush a batch, poll submitted jobs). This library provides the pieces both
//! sides share:
//!
//! - [`ReconcileClock`]: decides when the next tick is due.
//! - [`RetryTracker`]: bounds how often a failing unit of work is retried.
//!
//! # Invariants
//!
//! - A tick is due once at least one full interval has elapsed since the last one
//! - Retry accounting is per key and resets outside its window

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default retry limit per unit of work.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes

/// Tracks when the periodic reconciliation tick is due.
///
/// Time is always passed in so callers can drive it from a paused test clock.
#[derive(Debug, Clone)]
pub struct ReconcileClock {
    interval: Duration,
    last: Instant,
}

impl ReconcileClock {
    /// Create a clock whose first tick is due one interval after `start`.
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            last: start,
        }
    }

    /// The configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true if at least one interval has elapsed since the last tick.
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last) >= self.interval
    }

    /// Record that a tick ran at `now`.
    pub fn mark(&mut self, now: Instant) {
        self.last = now;
    }

    /// Time left until the next tick, zero if it is already due.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.interval
            .saturating_sub(now.saturating_duration_since(self.last))
    }
}

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per key.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)
    }
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a key.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.to_string()).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Number of failures recorded for a key inside the current window.
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|(count, _)| *count).unwrap_or(0)
    }

    /// Check if retries are exhausted for a key.
    pub fn is_exhausted(&self, key: &str) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a key (on success or when giving up).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Returns true if nothing is being tracked.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_not_due_before_interval() {
        let start = Instant::now();
        let clock = ReconcileClock::new(Duration::from_secs(5), start);

        assert!(!clock.is_due(start));
        assert!(!clock.is_due(start + Duration::from_secs(4)));
        assert!(clock.is_due(start + Duration::from_secs(5)));
        assert!(clock.is_due(start + Duration::from_secs(60)));
    }

    #[test]
    fn test_clock_mark_resets() {
        let start = Instant::now();
        let mut clock = ReconcileClock::new(Duration::from_secs(5), start);

        let tick = start + Duration::from_secs(7);
        assert!(clock.is_due(tick));
        clock.mark(tick);
        assert!(!clock.is_due(tick + Duration::from_secs(1)));
        assert!(clock.is_due(tick + Duration::from_secs(5)));
    }

    #[test]
    fn test_clock_remaining() {
        let start = Instant::now();
        let clock = ReconcileClock::new(Duration::from_secs(5), start);

        assert_eq!(clock.remaining(start), Duration::from_secs(5));
        assert_eq!(
            clock.remaining(start + Duration::from_secs(2)),
            Duration::from_secs(3)
        );
        assert_eq!(
            clock.remaining(start + Duration::from_secs(9)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_clock_tolerates_time_before_start() {
        let now = Instant::now();
        let clock = ReconcileClock::new(Duration::from_secs(5), now + Duration::from_secs(1));
        assert!(!clock.is_due(now));
        assert_eq!(clock.remaining(now), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));

        assert!(!tracker.record_failure("pool_a")); // 1st
        assert!(!tracker.record_failure("pool_a")); // 2nd
        assert!(!tracker.record_failure("pool_a")); // 3rd
        assert!(tracker.record_failure("pool_a")); // 4th - exhausted

        assert!(tracker.is_exhausted("pool_a"));
        assert!(!tracker.is_exhausted("pool_b"));
        assert_eq!(tracker.failures("pool_a"), 4);

        tracker.clear("pool_a");
        assert!(!tracker.is_exhausted("pool_a"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_retry_tracker_zero_retries() {
        let mut tracker = RetryTracker::new(0, Duration::from_secs(60));
        assert!(tracker.record_failure("batch"));
    }

    #[test]
    fn test_retry_tracker_window_expiry() {
        let mut tracker = RetryTracker::new(1, Duration::ZERO);
        tracker.record_failure("k");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!tracker.is_exhausted("k"));
        tracker.prune();
        assert_eq!(tracker.len(), 0);
    }
}
