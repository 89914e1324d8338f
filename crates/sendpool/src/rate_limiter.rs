//! Pool-wide dispatch throttle.
//!
//! A rolling-window limiter: at most `limit` grants within any `window`.
//! Grant times are kept in arrival order, so the wait until the next token is
//! simply the age of the oldest grant subtracted from the window.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Rolling-window rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    grants: VecDeque<Instant>,
}

impl RateLimiter {
    /// Allows `limit` grants per `window`. A zero limit is treated as one.
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            window,
            grants: VecDeque::with_capacity(limit),
        }
    }

    /// Grants per window.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Takes a token at `now`.
    ///
    /// # Errors
    ///
    /// Returns how long to wait before a token becomes available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.expire(now);
        if self.grants.len() < self.limit {
            self.grants.push_back(now);
            return Ok(());
        }
        let oldest = self.grants.front().copied().unwrap_or(now);
        Err((oldest + self.window).saturating_duration_since(now))
    }

    /// Tokens available at `now`.
    pub fn available(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.limit - self.grants.len()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&granted) = self.grants.front() {
            if now.saturating_duration_since(granted) >= self.window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn grants_up_to_limit() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(3, Duration::from_secs(1));
        assert_eq!(limiter.available(start), 3);
        for _ in 0..3 {
            limiter.try_acquire(start).unwrap();
        }
        assert_eq!(limiter.available(start), 0);
        assert_eq!(
            limiter.try_acquire(start).unwrap_err(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn window_rolls() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(2, Duration::from_secs(1));
        limiter.try_acquire(start).unwrap();
        limiter
            .try_acquire(start + Duration::from_millis(400))
            .unwrap();

        let wait = limiter
            .try_acquire(start + Duration::from_millis(500))
            .unwrap_err();
        assert_eq!(wait, Duration::from_millis(500));

        // The first grant has aged out; the second has not.
        limiter.try_acquire(start + Duration::from_secs(1)).unwrap();
        let wait = limiter
            .try_acquire(start + Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(wait, Duration::from_millis(400));
    }

    #[test]
    fn zero_limit_is_one() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.limit(), 1);
        assert_eq!(limiter.window(), Duration::from_secs(1));
    }

    #[test]
    fn never_exceeds_limit_in_any_window() {
        let start = Instant::now();
        let window = Duration::from_millis(1000);
        let mut limiter = RateLimiter::new(5, window);
        let mut granted = Vec::new();

        for step in 0..400u64 {
            let now = start + Duration::from_millis(step * 13);
            if limiter.try_acquire(now).is_ok() {
                granted.push(now);
            }
        }

        for (i, &t) in granted.iter().enumerate() {
            let in_window = granted[i..].iter().take_while(|&&u| u - t < window).count();
            assert!(in_window <= 5);
        }
        assert!(granted.len() >= 5 * 5);
    }
}
