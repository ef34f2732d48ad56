//! Reconnection Policy
//!
//! Bounded reconnection with a fixed delay between attempts. The attempt
//! counter starts over after every successful connection, so the bound
//! applies to consecutive failures only.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before each reconnection attempt.
    pub delay: Duration,
    /// Jitter as a fraction of `delay` (0.0 disables it).
    pub jitter_factor: f64,
    /// Consecutive failed attempts allowed (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            jitter_factor: 0.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Fixed delay without jitter.
    #[must_use]
    pub const fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    /// Build from feed settings.
    #[must_use]
    pub const fn from_feed_settings(settings: &crate::FeedSettings) -> Self {
        Self::fixed(settings.reconnect_delay, settings.max_reconnect_attempts)
    }
}

/// Tracks consecutive reconnection attempts.
///
/// ```rust
/// use market_ingest::infrastructure::binance::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_secs(5), 2));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(5)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(5)));
/// assert_eq!(policy.next_delay(), None);
///
/// policy.reset();
/// assert!(policy.should_retry());
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempt_count += 1;
        Some(self.apply_jitter(self.config.delay))
    }

    /// Start over after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Attempts since the last successful connection.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Configured attempt bound.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || duration.is_zero() {
            return duration;
        }

        let base = duration.as_secs_f64();
        let range = base * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);
        Duration::from_secs_f64((base + jitter).max(0.001))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_until_exhausted() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_millis(200), 3));

        for attempt in 1..=3 {
            assert_eq!(policy.next_delay(), Some(Duration::from_millis(200)));
            assert_eq!(policy.attempt_count(), attempt);
        }
        assert!(!policy.should_retry());
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn reset_restores_budget() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_secs(1), 1));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());

        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert!(policy.next_delay().is_some());
    }

    #[test]
    fn zero_max_attempts_is_unlimited() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::ZERO, 0));
        for _ in 0..1000 {
            assert!(policy.next_delay().is_some());
        }
    }

    #[test]
    fn jitter_stays_within_factor() {
        let config = ReconnectConfig {
            delay: Duration::from_secs(10),
            jitter_factor: 0.1,
            max_attempts: 0,
        };
        let mut policy = ReconnectPolicy::new(config);
        for _ in 0..100 {
            let delay = policy.next_delay().unwrap();
            assert!(delay >= Duration::from_secs(9) && delay <= Duration::from_secs(11));
        }
    }
}
