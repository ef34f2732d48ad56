//! Connection Age Monitor
//!
//! The exchange closes every connection after 24 hours. The monitor checks
//! the age of the current connection on a fixed interval and signals a
//! rotation once it is within the safety margin of that limit, so the
//! client can reconnect on its own schedule.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Rotation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationConfig {
    /// Lifetime the exchange allows a connection.
    pub max_age: Duration,
    /// Rotate this long before `max_age`.
    pub margin: Duration,
    /// How often the age is checked.
    pub check_interval: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
            margin: Duration::from_secs(60 * 60),
            check_interval: Duration::from_secs(30),
        }
    }
}

impl RotationConfig {
    /// Build from feed settings.
    #[must_use]
    pub const fn from_feed_settings(settings: &crate::FeedSettings) -> Self {
        Self {
            max_age: settings.max_connection_age,
            margin: settings.rotation_margin,
            check_interval: settings.age_check_interval,
        }
    }

    /// Age at which a connection is rotated.
    #[must_use]
    pub const fn rotate_after(&self) -> Duration {
        self.max_age.saturating_sub(self.margin)
    }
}

/// Watches one connection and fires `rotate` when it is too old.
pub struct ConnectionAgeMonitor {
    config: RotationConfig,
    connected_at: Instant,
    rotate: CancellationToken,
    cancel: CancellationToken,
}

impl ConnectionAgeMonitor {
    /// Create a monitor for a connection opened at `connected_at`.
    ///
    /// `rotate` is cancelled when the connection should be replaced; `cancel`
    /// stops the monitor.
    #[must_use]
    pub const fn new(
        config: RotationConfig,
        connected_at: Instant,
        rotate: CancellationToken,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            connected_at,
            rotate,
            cancel,
        }
    }

    /// Whether the connection has reached its rotation age at `now`.
    #[must_use]
    pub fn should_rotate(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.connected_at) >= self.config.rotate_after()
    }

    /// Run until the rotation fires or the monitor is cancelled.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if self.should_rotate(Instant::now()) {
                        tracing::info!(
                            age_secs = self.connected_at.elapsed().as_secs(),
                            rotate_after_secs = self.config.rotate_after().as_secs(),
                            "Connection reached rotation age"
                        );
                        self.rotate.cancel();
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RotationConfig {
        RotationConfig {
            max_age: Duration::from_secs(100),
            margin: Duration::from_secs(10),
            check_interval: Duration::from_secs(5),
        }
    }

    #[test]
    fn rotate_after_subtracts_margin() {
        assert_eq!(config().rotate_after(), Duration::from_secs(90));
        assert_eq!(
            RotationConfig::default().rotate_after(),
            Duration::from_secs(23 * 60 * 60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_age_is_reached() {
        let rotate = CancellationToken::new();
        let monitor = ConnectionAgeMonitor::new(
            config(),
            Instant::now(),
            rotate.clone(),
            CancellationToken::new(),
        );
        let task = tokio::spawn(monitor.run());

        tokio::time::sleep(Duration::from_secs(85)).await;
        assert!(!rotate.is_cancelled());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rotate.is_cancelled());
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_without_rotating() {
        let rotate = CancellationToken::new();
        let cancel = CancellationToken::new();
        let monitor =
            ConnectionAgeMonitor::new(config(), Instant::now(), rotate.clone(), cancel.clone());
        let task = tokio::spawn(monitor.run());

        cancel.cancel();
        task.await.unwrap();
        assert!(!rotate.is_cancelled());
    }
}
