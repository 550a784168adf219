use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use chrono::{DateTime, Utc, Duration};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitRule;
use crate::error::RateLimitExceeded;

#[derive(Debug)]
struct RequestWindow {
    // Oldest first
    timestamps: VecDeque<DateTime<Utc>>,
    window_size: Duration,
}

impl RequestWindow {
    fn new(window_size: Duration) -> Self {
        Self {
            timestamps: VecDeque::new(),
            window_size,
        }
    }

    fn cleanup_old_requests(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window_size;
        while self.timestamps.front().map_or(false, |ts| *ts < cutoff) {
            self.timestamps.pop_front();
        }
    }

    fn add_request(&mut self, now: DateTime<Utc>) {
        self.timestamps.push_back(now);
    }

    fn request_count(&self) -> usize {
        self.timestamps.len()
    }
}

/// Sliding-window limiter over caller-chosen keys such as `"webhook:<ip>"`.
///
/// State lives in this process only; separate instances do not share counts.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, RequestWindow>>,
    clock: Arc<dyn Clock>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RequestWindow>> {
        // Buckets stay consistent even if a holder panicked
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admits and records the attempt if fewer than `max_requests` were
    /// admitted for `key` within the trailing `window`. Rejected attempts are
    /// not recorded.
    pub fn check(
        &self,
        key: &str,
        max_requests: usize,
        window: Duration,
    ) -> Result<(), RateLimitExceeded> {
        let now = self.clock.now();
        let mut windows = self.lock();

        // Get or create window for key
        let entry = windows
            .entry(key.to_owned())
            .or_insert_with(|| RequestWindow::new(window));
        entry.window_size = window;
        entry.cleanup_old_requests(now);

        if entry.request_count() >= max_requests {
            debug!(key, max_requests, "rate limit exceeded");
            return Err(RateLimitExceeded);
        }

        entry.add_request(now);
        Ok(())
    }

    pub fn check_rule(&self, key: &str, rule: &RateLimitRule) -> Result<(), RateLimitExceeded> {
        self.check(key, rule.max_requests, Duration::seconds(rule.window_seconds))
    }

    /// Drops buckets with nothing left inside the window they were last
    /// checked with. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.lock();
        let before = windows.len();

        windows.retain(|_, window| {
            window.cleanup_old_requests(now);
            !window.timestamps.is_empty()
        });

        let removed = before - windows.len();
        if removed > 0 {
            debug!(removed, remaining = windows.len(), "rate limit buckets reaped");
        }
        removed
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        (RateLimiter::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_rate_limiter() {
        let (limiter, clock) = limiter();
        let window = Duration::seconds(60);

        // Should allow requests up to limit
        for _ in 0..5 {
            assert!(limiter.check("lead:10.0.0.1", 5, window).is_ok());
            clock.advance(Duration::seconds(1));
        }

        // Should deny requests over limit
        assert_eq!(limiter.check("lead:10.0.0.1", 5, window), Err(RateLimitExceeded));

        // Wait for the first request to leave the window
        clock.set(Utc.timestamp_opt(1_700_000_061, 0).unwrap());

        // Should allow requests again
        assert!(limiter.check("lead:10.0.0.1", 5, window).is_ok());
    }

    #[test]
    fn test_entry_at_cutoff_still_counts() {
        let (limiter, clock) = limiter();
        let window = Duration::seconds(10);

        assert!(limiter.check("k", 1, window).is_ok());
        clock.advance(Duration::seconds(10));
        assert!(limiter.check("k", 1, window).is_err());
        clock.advance(Duration::seconds(1));
        assert!(limiter.check("k", 1, window).is_ok());
    }

    #[test]
    fn test_rejections_are_not_recorded() {
        let (limiter, clock) = limiter();
        let window = Duration::seconds(10);

        assert!(limiter.check("k", 1, window).is_ok());
        for _ in 0..5 {
            clock.advance(Duration::seconds(2));
            assert!(limiter.check("k", 1, window).is_err());
        }
        // Only the admitted request at t=0 counted, so t=11 is free again
        clock.advance(Duration::seconds(1));
        assert!(limiter.check("k", 1, window).is_ok());
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _) = limiter();
        let window = Duration::seconds(60);

        assert!(limiter.check("webhook:1.1.1.1", 1, window).is_ok());
        assert!(limiter.check("webhook:1.1.1.1", 1, window).is_err());
        assert!(limiter.check("webhook:2.2.2.2", 1, window).is_ok());
        assert!(limiter.check("lead:1.1.1.1", 1, window).is_ok());
    }

    #[test]
    fn test_zero_allowance_always_rejects() {
        let (limiter, _) = limiter();
        assert!(limiter.check("k", 0, Duration::seconds(60)).is_err());
    }

    #[test]
    fn test_check_rule() {
        let (limiter, _) = limiter();
        let rule = RateLimitRule { max_requests: 2, window_seconds: 300 };

        assert!(limiter.check_rule("lead:ip", &rule).is_ok());
        assert!(limiter.check_rule("lead:ip", &rule).is_ok());
        assert!(limiter.check_rule("lead:ip", &rule).is_err());
    }

    #[test]
    fn test_cleanup_removes_only_expired_buckets() {
        let (limiter, clock) = limiter();

        limiter.check("old", 10, Duration::seconds(10)).unwrap();
        clock.advance(Duration::seconds(8));
        limiter.check("fresh", 10, Duration::seconds(10)).unwrap();
        clock.advance(Duration::seconds(5));

        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.tracked_keys(), 1);

        // The surviving bucket still counts its request
        assert!(limiter.check("fresh", 1, Duration::seconds(10)).is_err());
    }
}
