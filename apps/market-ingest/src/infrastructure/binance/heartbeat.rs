//! Heartbeat Manager
//!
//! Keeps the feed connection honest. A ping is requested on every interval;
//! any inbound frame (data, pong, or the exchange's own ping) counts as
//! liveness. Silence longer than the timeout is reported so the client can
//! tear the connection down and reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Silence tolerated before the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Build from feed settings.
    #[must_use]
    pub const fn from_feed_settings(settings: &crate::FeedSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            timeout: settings.heartbeat_timeout,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a WebSocket ping.
    SendPing,
    /// Nothing arrived within the timeout.
    Timeout,
}

/// Liveness shared between the heartbeat manager and the read loop.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
            pings_sent: AtomicU64::new(0),
            pongs_received: AtomicU64::new(0),
        }
    }

    /// Any inbound frame arrived.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// A pong arrived.
    pub fn record_pong(&self) {
        self.pongs_received.fetch_add(1, Ordering::Relaxed);
        self.record_activity();
    }

    /// A ping went out.
    pub fn mark_ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Pings sent on this connection.
    #[must_use]
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::Relaxed)
    }

    /// Pongs received on this connection.
    #[must_use]
    pub fn pongs_received(&self) -> u64 {
        self.pongs_received.load(Ordering::Relaxed)
    }

    /// Start over for a new connection.
    pub fn reset(&self) {
        *self.last_activity.write() = Instant::now();
        self.pings_sent.store(0, Ordering::Relaxed);
        self.pongs_received.store(0, Ordering::Relaxed);
    }
}

/// Emits ping requests and detects silent connections.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the event channel closes, or a timeout fires.
    pub async fn run(self) {
        let mut interval = tokio::time::interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !self.tick().await {
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) -> bool {
        let idle = self.state.idle_for();
        if idle > self.config.timeout {
            tracing::warn!(
                idle_secs = idle.as_secs(),
                timeout_secs = self.config.timeout.as_secs(),
                "Heartbeat timeout detected"
            );
            let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
            return false;
        }

        self.event_tx.send(HeartbeatEvent::SendPing).await.is_ok()
    }
}
