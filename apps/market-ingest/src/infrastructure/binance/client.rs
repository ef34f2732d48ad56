//! Binance Futures WebSocket Client
//!
//! Maintains one logical subscription to the exchange's market streams and
//! hands every decoded data event to the pipeline.
//!
//! # Stream URL
//!
//! - Raw: `wss://fstream.binance.com/ws`
//! - Combined: `wss://fstream.binance.com/stream?streams=<a>/<b>`
//!
//! # Connection Lifecycle
//!
//! - Subscribes the desired streams after every connect
//! - Pings on a fixed interval; silence past the timeout is a fault
//! - Reconnects after a fault with a fixed delay, up to a bounded number
//!   of consecutive attempts
//! - Rotates the connection shortly before the exchange's 24 hour limit
//!   without counting it as a fault

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::age::{ConnectionAgeMonitor, RotationConfig};
use super::codec::{CodecError, FeedCodec};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::{FeedMessage, SubscriptionRequest};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::state::{FeedConnectionState, FeedState};
use crate::domain::market::MarketEvent;
use crate::infrastructure::metrics::{self, FeedMessageType, ReconnectReason};

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the feed client.
#[derive(Debug, thiserror::Error)]
pub enum FeedClientError {
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Nothing arrived within the heartbeat timeout.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Connection closed by the server.
    #[error("connection closed")]
    ConnectionClosed,

    /// `run` was called on a client that is already running.
    #[error("feed client is already running")]
    AlreadyRunning,

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),
}

impl FeedClientError {
    const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::WebSocket(_) => "websocket",
            Self::Codec(_) => "codec",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ConnectionClosed => "closed",
            Self::AlreadyRunning => "already_running",
            Self::MaxReconnectAttemptsExceeded(_) => "reconnect_exhausted",
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the feed client.
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// WebSocket URL.
    pub url: String,
    /// Streams subscribed on every connect.
    pub streams: Vec<String>,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Connection rotation configuration.
    pub rotation: RotationConfig,
    /// Handshake timeout.
    pub connect_timeout: Duration,
}

impl FeedClientConfig {
    /// Create a configuration with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>, streams: Vec<String>) -> Self {
        Self {
            url: url.into(),
            streams,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            rotation: RotationConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Build from feed settings.
    #[must_use]
    pub fn from_feed_settings(settings: &crate::FeedSettings) -> Self {
        Self {
            url: settings.ws_url.clone(),
            streams: settings.streams.clone(),
            reconnect: ReconnectConfig::from_feed_settings(settings),
            heartbeat: HeartbeatConfig::from_feed_settings(settings),
            rotation: RotationConfig::from_feed_settings(settings),
            connect_timeout: settings.connect_timeout,
        }
    }
}

/// How a connection session ended without a fault.
enum SessionEnd {
    Shutdown,
    Rotate,
}

// =============================================================================
// Feed Client
// =============================================================================

/// WebSocket client for the exchange's market streams.
pub struct FeedClient {
    config: FeedClientConfig,
    codec: FeedCodec,
    market_tx: mpsc::Sender<MarketEvent>,
    cancel: CancellationToken,
    state: Arc<FeedState>,
    streams: RwLock<Vec<String>>,
    command_tx: mpsc::UnboundedSender<SubscriptionRequest>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<SubscriptionRequest>>>,
    next_request_id: AtomicU64,
}

impl FeedClient {
    /// Create a new feed client.
    #[must_use]
    pub fn new(
        config: FeedClientConfig,
        market_tx: mpsc::Sender<MarketEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let mut streams = Vec::with_capacity(config.streams.len());
        for stream in &config.streams {
            if !streams.contains(stream) {
                streams.push(stream.clone());
            }
        }

        Self {
            config,
            codec: FeedCodec::new(),
            market_tx,
            cancel,
            state: Arc::new(FeedState::new()),
            streams: RwLock::new(streams),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> FeedConnectionState {
        self.state.get_state()
    }

    /// Shared state and counters.
    #[must_use]
    pub fn feed_state(&self) -> Arc<FeedState> {
        Arc::clone(&self.state)
    }

    /// Streams subscribed on every connect.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.streams.read().clone()
    }

    /// Add streams. Applied to the live connection when connected and
    /// restored after every reconnect.
    pub fn subscribe(&self, streams: Vec<String>) {
        let added: Vec<String> = {
            let mut current = self.streams.write();
            let mut added = Vec::new();
            for stream in streams {
                if !current.contains(&stream) {
                    current.push(stream.clone());
                    added.push(stream);
                }
            }
            added
        };

        if !added.is_empty() && self.state() == FeedConnectionState::Connected {
            let request = SubscriptionRequest::subscribe(added, self.next_id());
            let _ = self.command_tx.send(request);
        }
    }

    /// Remove streams.
    pub fn unsubscribe(&self, streams: &[String]) {
        let removed: Vec<String> = {
            let mut current = self.streams.write();
            let removed = current
                .iter()
                .filter(|s| streams.contains(s))
                .cloned()
                .collect();
            current.retain(|s| !streams.contains(s));
            removed
        };

        if !removed.is_empty() && self.state() == FeedConnectionState::Connected {
            let request = SubscriptionRequest::unsubscribe(removed, self.next_id());
            let _ = self.command_tx.send(request);
        }
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run the connection loop until cancelled or reconnection attempts are
    /// exhausted.
    ///
    /// # Errors
    ///
    /// Returns `FeedClientError::MaxReconnectAttemptsExceeded` when the feed
    /// cannot be re-established, or `AlreadyRunning` on a second call.
    pub async fn run(self: Arc<Self>) -> Result<(), FeedClientError> {
        let Some(mut commands) = self.command_rx.lock().take() else {
            return Err(FeedClientError::AlreadyRunning);
        };
        let mut reconnect_policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.state.set_state(FeedConnectionState::Connecting);

            match self
                .connect_and_run(&mut commands, &mut reconnect_policy)
                .await
            {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Rotate) => {
                    tracing::info!("Rotating feed connection");
                    self.state.increment_rotations();
                    self.state.set_state(FeedConnectionState::Reconnecting);
                    metrics::record_reconnect(ReconnectReason::Rotation);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Feed connection error");
                    self.state.set_error(e.to_string());
                    metrics::record_feed_error(e.kind());

                    let Some(delay) = reconnect_policy.next_delay() else {
                        let attempts = reconnect_policy.max_attempts();
                        tracing::error!(attempts, "Feed reconnection attempts exhausted");
                        self.state.set_state(FeedConnectionState::Stopped);
                        return Err(FeedClientError::MaxReconnectAttemptsExceeded(attempts));
                    };

                    let attempt = reconnect_policy.attempt_count();
                    tracing::info!(
                        attempt,
                        max_attempts = reconnect_policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        "Reconnecting to feed"
                    );
                    self.state.set_state(FeedConnectionState::Reconnecting);
                    self.state.increment_reconnect_attempts();
                    metrics::record_reconnect(ReconnectReason::Fault);

                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!("Feed client stopped");
        self.state.set_state(FeedConnectionState::Stopped);
        Ok(())
    }

    /// Connect, subscribe, and pump frames until the session ends.
    async fn connect_and_run(
        &self,
        commands: &mut mpsc::UnboundedReceiver<SubscriptionRequest>,
        reconnect_policy: &mut ReconnectPolicy,
    ) -> Result<SessionEnd, FeedClientError> {
        tracing::info!(url = %self.config.url, "Connecting to feed");

        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.config.url.as_str()),
        );
        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(SessionEnd::Shutdown),
            result = connect => result
                .map_err(|_| FeedClientError::ConnectTimeout(self.config.connect_timeout))??,
        };

        reconnect_policy.reset();
        self.state.set_state(FeedConnectionState::Connected);
        metrics::set_feed_connected(true);

        let (mut write, mut read) = ws_stream.split();

        // Requests queued while disconnected are covered by the full resubscribe.
        while commands.try_recv().is_ok() {}
        let streams = self.subscriptions();
        if !streams.is_empty() {
            let request = SubscriptionRequest::subscribe(streams, self.next_id());
            self.send_request(&mut write, &request).await?;
        }

        let session = self.cancel.child_token();
        let _session_guard = session.clone().drop_guard();

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(8);
        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat.clone(),
                heartbeat_state.clone(),
                heartbeat_tx,
                session.clone(),
            )
            .run(),
        );

        let rotate = CancellationToken::new();
        tokio::spawn(
            ConnectionAgeMonitor::new(
                self.config.rotation,
                Instant::now(),
                rotate.clone(),
                session.clone(),
            )
            .run(),
        );

        let outcome = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break Ok(SessionEnd::Shutdown);
                }
                () = rotate.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break Ok(SessionEnd::Rotate);
                }
                event = heartbeat_rx.recv() => {
                    match event {
                        Some(HeartbeatEvent::SendPing) => {
                            heartbeat_state.mark_ping_sent();
                            if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                                break Err(e.into());
                            }
                        }
                        Some(HeartbeatEvent::Timeout) | None => {
                            break Err(FeedClientError::HeartbeatTimeout);
                        }
                    }
                }
                request = commands.recv() => {
                    if let Some(request) = request
                        && let Err(e) = self.send_request(&mut write, &request).await
                    {
                        break Err(e);
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat_state.record_activity();
                            if !self.handle_text_message(text.as_str()).await {
                                break Ok(SessionEnd::Shutdown);
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            heartbeat_state.record_pong();
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat_state.record_activity();
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(frame = ?frame, "Server sent close frame");
                            break Err(FeedClientError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {
                            heartbeat_state.record_activity();
                        }
                        Some(Err(e)) => break Err(e.into()),
                        None => {
                            tracing::info!("WebSocket stream ended");
                            break Err(FeedClientError::ConnectionClosed);
                        }
                    }
                }
            }
        };

        metrics::set_feed_connected(false);
        outcome
    }

    /// Decode and dispatch one text frame. Returns `false` when the
    /// pipeline side has gone away.
    async fn handle_text_message(&self, text: &str) -> bool {
        self.state.increment_messages();

        let message = match self.codec.decode(text) {
            Ok(message) => message,
            Err(e) => {
                self.state.increment_malformed();
                metrics::record_feed_message(FeedMessageType::Malformed);
                tracing::debug!(error = %e, frame = %preview(text), "Dropping malformed frame");
                return true;
            }
        };

        let msg_type = match &message {
            FeedMessage::AggTrade(_) => FeedMessageType::AggTrade,
            FeedMessage::Trade(_) => FeedMessageType::Trade,
            FeedMessage::Depth(_) => FeedMessageType::Depth,
            FeedMessage::Control(reply) => {
                tracing::debug!(id = ?reply.id, result = %reply.result, "Subscription reply");
                FeedMessageType::Control
            }
            FeedMessage::Error(reply) => {
                tracing::warn!(
                    id = ?reply.id,
                    code = reply.error.code,
                    msg = %reply.error.msg,
                    "Feed rejected request"
                );
                FeedMessageType::Control
            }
            FeedMessage::Ignored { event_type, symbol } => {
                self.state.increment_ignored();
                tracing::debug!(event_type = %event_type, symbol = ?symbol, "Ignoring unstored event");
                FeedMessageType::Ignored
            }
            FeedMessage::Unsupported(event_type) => {
                self.state.increment_unsupported();
                tracing::trace!(event_type = %event_type, "Ignoring unsupported event");
                FeedMessageType::Unsupported
            }
        };
        metrics::record_feed_message(msg_type);

        let Some(event) = message.into_market_event() else {
            return true;
        };

        if self.market_tx.send(event).await.is_err() {
            tracing::debug!("Event channel closed, stopping feed");
            return false;
        }
        self.state.increment_forwarded();
        true
    }

    /// Send a subscription request.
    async fn send_request<W>(
        &self,
        write: &mut W,
        request: &SubscriptionRequest,
    ) -> Result<(), FeedClientError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: std::fmt::Display,
    {
        let json = self.codec.encode_request(request)?;

        tracing::info!(
            method = request.method,
            streams = ?request.params,
            id = request.id,
            "Sending subscription request"
        );

        write.send(Message::Text(json.into())).await.map_err(|e| {
            FeedClientError::ConnectionFailed(format!("failed to send {}: {e}", request.method))
        })
    }
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (FeedClient, mpsc::Receiver<MarketEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let config = FeedClientConfig::new(
            "ws://127.0.0.1:1",
            vec!["btcusdt@aggTrade".to_string(), "btcusdt@aggTrade".to_string()],
        );
        (FeedClient::new(config, tx, CancellationToken::new()), rx)
    }

    #[test]
    fn duplicate_streams_are_collapsed() {
        let (client, _rx) = client();
        assert_eq!(client.subscriptions(), vec!["btcusdt@aggTrade"]);
        assert_eq!(client.state(), FeedConnectionState::Disconnected);
    }

    #[test]
    fn subscribe_and_unsubscribe_update_desired_set() {
        let (client, _rx) = client();
        client.subscribe(vec!["ethusdt@trade".into(), "btcusdt@aggTrade".into()]);
        assert_eq!(client.subscriptions(), vec!["btcusdt@aggTrade", "ethusdt@trade"]);

        client.unsubscribe(&["btcusdt@aggTrade".to_string()]);
        assert_eq!(client.subscriptions(), vec!["ethusdt@trade"]);
    }

    #[tokio::test]
    async fn data_frames_are_forwarded_and_control_frames_are_not() {
        let (client, mut rx) = client();

        let agg = r#"{"e":"aggTrade","E":1,"a":1,"s":"BTCUSDT","p":"1","q":"1","f":1,"l":1,"T":1,"m":false}"#;
        assert!(client.handle_text_message(agg).await);
        assert!(client.handle_text_message(r#"{"result":null,"id":1}"#).await);
        assert!(client.handle_text_message("garbage").await);
        assert!(client.handle_text_message(r#"{"e":"kline","E":1,"s":"BTCUSDT"}"#).await);
        assert!(client.handle_text_message(r#"{"e":"fundingNotice","E":1}"#).await);

        assert!(matches!(rx.try_recv(), Ok(MarketEvent::AggTrade(_))));
        assert!(rx.try_recv().is_err());

        let state = client.feed_state();
        assert_eq!(state.get_messages_received(), 5);
        assert_eq!(state.get_events_forwarded(), 1);
        assert_eq!(state.get_malformed(), 1);
        assert_eq!(state.get_ignored(), 1);
        assert_eq!(state.get_unsupported(), 1);
    }

    #[tokio::test]
    async fn closed_event_channel_stops_session() {
        let (client, rx) = client();
        drop(rx);
        let agg = r#"{"e":"aggTrade","E":1,"a":1,"s":"BTCUSDT","p":"1","q":"1","f":1,"l":1,"T":1,"m":false}"#;
        assert!(!client.handle_text_message(agg).await);
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let (client, _rx) = client();
        let client = Arc::new(client);
        let _ = client.command_rx.lock().take();
        assert!(matches!(
            client.run().await,
            Err(FeedClientError::AlreadyRunning)
        ));
    }
}
