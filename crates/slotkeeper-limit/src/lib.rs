//! Windowed rate limiting keyed by client address.
//!
//! Two limiters run in a slotkeeper server, built from the same
//! [`RateLimiter`] with different [`RateLimitConfig`]s:
//!
//! - **connection attempts**: short window, generous threshold. Every new
//!   WebSocket counts.
//! - **invite failures**: long window, tight threshold. Only *failed*
//!   validations count (via [`RateLimiter::record_failure`]); callers peek
//!   with `check(key, false)` before validating.
//!
//! # Windows
//!
//! A bucket remembers when its window started and how many attempts it has
//! seen. Once `window` has passed since that start the bucket is logically
//! fresh: the next touch replaces it with a zero count. Nobody is penalized
//! for attempts outside the current window.
//!
//! Time is read from `tokio::time::Instant`, so tests drive windows with a
//! paused clock instead of sleeping.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Parameters for one limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Length of one window, in seconds.
    pub window_secs: u64,
    /// Attempts allowed per window. Attempt `max_attempts + 1` is refused.
    pub max_attempts: u32,
    /// Once more buckets than this exist, a check also sweeps expired ones.
    pub cleanup_threshold: usize,
}

impl RateLimitConfig {
    /// Preset for connection attempts: 30 per minute.
    pub fn connections() -> Self {
        Self {
            window_secs: 60,
            max_attempts: 30,
            cleanup_threshold: 1000,
        }
    }

    /// Preset for invite failures: 10 per 15 minutes.
    pub fn invite_failures() -> Self {
        Self {
            window_secs: 900,
            max_attempts: 10,
            cleanup_threshold: 1000,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::connections()
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// The outcome of a [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the attempt may proceed.
    pub allowed: bool,
    /// Attempts left in the current window.
    pub remaining: u32,
    /// Seconds until the current window ends. Zero when allowed.
    pub retry_after_secs: u64,
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: Instant,
    count: u32,
}

impl Bucket {
    fn fresh(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.window_start) >= window
    }
}

/// A per-key windowed attempt counter.
///
/// All mutation for a key happens under one lock acquisition, so two
/// concurrent callers can't both see "allowed" for the last slot.
pub struct RateLimiter {
    name: &'static str,
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Creates a limiter. `name` only appears in log lines.
    pub fn new(name: &'static str, config: RateLimitConfig) -> Self {
        Self {
            name,
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// The configuration this limiter was built with.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Checks `key` and, if `increment`, counts this attempt.
    ///
    /// With `increment` the attempt itself is judged: the N-th attempt in a
    /// window is allowed when `N <= max_attempts`. Without it the question
    /// is "would one more attempt be allowed?", i.e. `count < max_attempts`.
    pub fn check(&self, key: &str, increment: bool) -> RateLimitDecision {
        let now = Instant::now();
        let window = self.config.window();
        let max = self.config.max_attempts;

        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(key.to_owned())
            .and_modify(|b| {
                if b.expired(now, window) {
                    *b = Bucket::fresh(now);
                }
            })
            .or_insert_with(|| Bucket::fresh(now));

        let allowed = if increment {
            bucket.count = bucket.count.saturating_add(1);
            bucket.count <= max
        } else {
            bucket.count < max
        };
        let remaining = max.saturating_sub(bucket.count);
        let retry_after_secs = if allowed {
            0
        } else {
            let left = window.saturating_sub(now.duration_since(bucket.window_start));
            // Round up so a client never retries a moment too early.
            (left.as_millis().div_ceil(1000) as u64).max(1)
        };

        if buckets.len() > self.config.cleanup_threshold {
            Self::sweep(&mut buckets, now, window);
        }

        if !allowed {
            tracing::debug!(limiter = self.name, key, retry_after_secs, "rate limit exceeded");
        }

        RateLimitDecision {
            allowed,
            remaining,
            retry_after_secs,
        }
    }

    /// Counts one failure against `key` without judging it.
    pub fn record_failure(&self, key: &str) {
        let now = Instant::now();
        let window = self.config.window();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_owned()).or_insert_with(|| Bucket::fresh(now));
        if bucket.expired(now, window) {
            *bucket = Bucket::fresh(now);
        }
        bucket.count = bucket.count.saturating_add(1);
    }

    /// Forgets `key` entirely. Administrative use only.
    pub fn reset(&self, key: &str) {
        if self.buckets.lock().remove(key).is_some() {
            tracing::info!(limiter = self.name, key, "rate limit bucket reset");
        }
    }

    /// Drops every bucket whose window has elapsed. Returns how many.
    ///
    /// Purely a memory concern: an expired bucket behaves exactly like a
    /// missing one.
    pub fn cleanup(&self) -> usize {
        let mut buckets = self.buckets.lock();
        Self::sweep(&mut buckets, Instant::now(), self.config.window())
    }

    /// Number of buckets currently held (expired ones included).
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Returns `true` if no buckets are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(
        buckets: &mut HashMap<String, Bucket>,
        now: Instant,
        window: Duration,
    ) -> usize {
        let before = buckets.len();
        buckets.retain(|_, b| !b.expired(now, window));
        before - buckets.len()
    }
}

#[cfg(test)]
mod tests {
    //! Window behavior is tested on a paused tokio clock:
    //! `tokio::time::advance` moves `Instant::now()` forward instantly.

    use super::*;

    fn limiter(window_secs: u64, max_attempts: u32) -> RateLimiter {
        RateLimiter::new(
            "test",
            RateLimitConfig {
                window_secs,
                max_attempts,
                cleanup_threshold: 1000,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_allows_exactly_max_then_blocks() {
        let rl = limiter(60, 3);

        for expected_remaining in [2, 1, 0] {
            let d = rl.check("1.2.3.4", true);
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }

        let d = rl.check("1.2.3.4", true);
        assert!(!d.allowed, "fourth attempt must be blocked");
        assert_eq!(d.remaining, 0);
        assert_eq!(d.retry_after_secs, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_fresh_window_restores_full_quota() {
        let rl = limiter(60, 2);
        rl.check("ip", true);
        rl.check("ip", true);
        assert!(!rl.check("ip", true).allowed);

        tokio::time::advance(Duration::from_secs(60)).await;

        let d = rl.check("ip", true);
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_counts_from_window_start() {
        let rl = limiter(60, 1);
        rl.check("ip", true);

        tokio::time::advance(Duration::from_secs(45)).await;

        let d = rl.check("ip", true);
        assert!(!d.allowed);
        assert_eq!(d.retry_after_secs, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_rounds_up_partial_seconds() {
        let rl = limiter(60, 1);
        rl.check("ip", true);

        tokio::time::advance(Duration::from_millis(59_500)).await;

        assert_eq!(rl.check("ip", true).retry_after_secs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_without_increment_does_not_count() {
        let rl = limiter(60, 2);
        for _ in 0..10 {
            assert!(rl.check("ip", false).allowed);
        }
        assert_eq!(rl.check("ip", false).remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_failures_block_the_eleventh_check() {
        let rl = RateLimiter::new("invite", RateLimitConfig::invite_failures());
        for _ in 0..10 {
            assert!(rl.check("ip", false).allowed);
            rl.record_failure("ip");
        }

        let d = rl.check("ip", false);

        assert!(!d.allowed);
        assert!(d.retry_after_secs > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let rl = limiter(60, 1);
        rl.check("a", true);
        assert!(!rl.check("a", true).allowed);
        assert!(rl.check("b", true).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_bucket() {
        let rl = limiter(60, 1);
        rl.check("ip", true);
        assert!(!rl.check("ip", true).allowed);

        rl.reset("ip");

        assert!(rl.check("ip", true).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_only_expired() {
        let rl = limiter(60, 5);
        rl.check("old", true);
        tokio::time::advance(Duration::from_secs(30)).await;
        rl.check("new", true);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(rl.cleanup(), 1);
        assert_eq!(rl.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opportunistic_cleanup_past_threshold() {
        let rl = RateLimiter::new(
            "test",
            RateLimitConfig {
                window_secs: 10,
                max_attempts: 5,
                cleanup_threshold: 3,
            },
        );
        for key in ["a", "b", "c"] {
            rl.check(key, true);
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        // Fourth key pushes the map over the threshold.
        rl.check("d", true);

        assert_eq!(rl.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_failure_in_expired_window_starts_fresh() {
        let rl = limiter(60, 2);
        rl.record_failure("ip");
        rl.record_failure("ip");
        assert!(!rl.check("ip", false).allowed);

        tokio::time::advance(Duration::from_secs(61)).await;
        rl.record_failure("ip");

        let d = rl.check("ip", false);
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
    }
}
