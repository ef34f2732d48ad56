//! Feed Connection State
//!
//! Lifecycle state and counters of the feed client, shared with the health
//! server.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Feed connection lifecycle.
///
/// `Disconnected → Connecting → Connected → (Reconnecting | Stopped)`.
/// `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedConnectionState {
    /// Not started.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Open and subscribed.
    Connected,
    /// Waiting to reconnect after a fault or rotation.
    Reconnecting,
    /// Shut down or out of reconnection attempts.
    Stopped,
}

impl FeedConnectionState {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        }
    }
}

/// Shared feed state and counters.
#[derive(Debug, Default)]
pub struct FeedState {
    state: RwLock<FeedConnectionState>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    reconnect_attempts: AtomicU32,
    reconnects: AtomicU64,
    rotations: AtomicU64,
    messages_received: AtomicU64,
    events_forwarded: AtomicU64,
    malformed: AtomicU64,
    ignored: AtomicU64,
    unsupported: AtomicU64,
}

impl FeedState {
    /// Create state in `Disconnected`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection state. `Stopped` is never left.
    pub fn set_state(&self, state: FeedConnectionState) {
        let mut current = self.state.write();
        if *current == FeedConnectionState::Stopped {
            return;
        }
        *current = state;
        drop(current);

        if state == FeedConnectionState::Connected {
            *self.last_connected_at.write() = Some(Utc::now());
            self.reconnect_attempts.store(0, Ordering::Relaxed);
            *self.last_error.write() = None;
        }
    }

    /// Remember the most recent connection error.
    pub fn set_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }

    /// Record a reconnection attempt after a fault.
    pub fn increment_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an age-based rotation.
    pub fn increment_rotations(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a received text frame.
    pub fn increment_messages(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event handed to the forwarder.
    pub fn increment_forwarded(&self) {
        self.events_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame that could not be decoded.
    pub fn increment_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a known event type that is not stored.
    pub fn increment_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event type that is not ingested.
    pub fn increment_unsupported(&self) {
        self.unsupported.fetch_add(1, Ordering::Relaxed);
    }

    /// Current connection state.
    #[must_use]
    pub fn get_state(&self) -> FeedConnectionState {
        *self.state.read()
    }

    /// When the current or last connection opened.
    #[must_use]
    pub fn get_last_connected_at(&self) -> Option<DateTime<Utc>> {
        *self.last_connected_at.read()
    }

    /// Most recent connection error.
    #[must_use]
    pub fn get_last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Consecutive reconnect attempts (0 while connected).
    #[must_use]
    pub fn get_reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Total reconnects after faults.
    #[must_use]
    pub fn get_reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Total age-based rotations.
    #[must_use]
    pub fn get_rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Text frames received.
    #[must_use]
    pub fn get_messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Events forwarded.
    #[must_use]
    pub fn get_events_forwarded(&self) -> u64 {
        self.events_forwarded.load(Ordering::Relaxed)
    }

    /// Frames that could not be decoded.
    #[must_use]
    pub fn get_malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Frames of known event types that are not stored.
    #[must_use]
    pub fn get_ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Frames of unsupported event types.
    #[must_use]
    pub fn get_unsupported(&self) -> u64 {
        self.unsupported.load(Ordering::Relaxed)
    }

    /// Serializable snapshot.
    #[must_use]
    pub fn snapshot(&self) -> FeedStateSnapshot {
        FeedStateSnapshot {
            state: self.get_state(),
            last_connected_at: self.get_last_connected_at(),
            last_error: self.get_last_error(),
            reconnect_attempts: self.get_reconnect_attempts(),
            reconnects: self.get_reconnects(),
            rotations: self.get_rotations(),
            messages_received: self.get_messages_received(),
            events_forwarded: self.get_events_forwarded(),
            malformed: self.get_malformed(),
            ignored: self.get_ignored(),
            unsupported: self.get_unsupported(),
        }
    }
}

/// Point-in-time copy of [`FeedState`].
#[derive(Debug, Clone, Serialize)]
pub struct FeedStateSnapshot {
    /// Connection state.
    pub state: FeedConnectionState,
    /// When the current or last connection opened.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Most recent connection error.
    pub last_error: Option<String>,
    /// Consecutive reconnect attempts.
    pub reconnect_attempts: u32,
    /// Total reconnects after faults.
    pub reconnects: u64,
    /// Total age-based rotations.
    pub rotations: u64,
    /// Text frames received.
    pub messages_received: u64,
    /// Events forwarded.
    pub events_forwarded: u64,
    /// Undecodable frames.
    pub malformed: u64,
    /// Known event types that are not stored.
    pub ignored: u64,
    /// Unsupported event types.
    pub unsupported: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_resets_attempts_and_error() {
        let state = FeedState::new();
        state.increment_reconnect_attempts();
        state.set_error("refused".into());

        state.set_state(FeedConnectionState::Connected);

        assert_eq!(state.get_reconnect_attempts(), 0);
        assert_eq!(state.get_reconnects(), 1);
        assert!(state.get_last_error().is_none());
        assert!(state.get_last_connected_at().is_some());
    }

    #[test]
    fn stopped_is_terminal() {
        let state = FeedState::new();
        state.set_state(FeedConnectionState::Stopped);
        state.set_state(FeedConnectionState::Connecting);
        assert_eq!(state.get_state(), FeedConnectionState::Stopped);
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&FeedConnectionState::Reconnecting).unwrap(),
            "\"reconnecting\""
        );
        assert_eq!(FeedConnectionState::Stopped.as_str(), "stopped");
    }
}
