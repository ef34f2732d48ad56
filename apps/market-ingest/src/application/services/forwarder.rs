//! Feed Forwarder
//!
//! Bridges the feed client and the stream buffer. Every event decoded from
//! the feed is encoded once and appended to the buffer; a transient buffer
//! fault is retried under the produce policy, and an event that still cannot
//! be appended goes to the error channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::errors::ErrorReporter;
use super::retry::{RetryOutcome, RetryPolicy, retry_with};
use crate::application::ports::{BufferError, StreamBuffer};
use crate::domain::market::MarketEvent;
use crate::domain::records::{ErrorKind, ErrorRecord};
use crate::infrastructure::metrics;

/// Forwarder counters.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    produced: AtomicU64,
    failed: AtomicU64,
}

impl ForwarderStats {
    /// Events appended to the buffer.
    #[must_use]
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// Events routed to the error channel.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Appends feed events to the stream buffer.
pub struct FeedForwarder {
    buffer: Arc<dyn StreamBuffer>,
    errors: ErrorReporter,
    retry: RetryPolicy,
    cancel: CancellationToken,
    stats: Arc<ForwarderStats>,
}

impl FeedForwarder {
    /// Create a forwarder.
    #[must_use]
    pub fn new(
        buffer: Arc<dyn StreamBuffer>,
        errors: ErrorReporter,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            buffer,
            errors,
            retry,
            cancel,
            stats: Arc::new(ForwarderStats::default()),
        }
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.stats)
    }

    /// Forward events until cancelled or the feed side closes.
    ///
    /// On cancellation the channel is closed and every event already queued
    /// is still forwarded, so each one ends up buffered or in the error
    /// channel.
    pub async fn run(self, mut events: mpsc::Receiver<MarketEvent>) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    events.close();
                    let mut drained = 0_u64;
                    while let Some(event) = events.recv().await {
                        self.forward(event).await;
                        drained += 1;
                    }
                    tracing::debug!(drained, "Queued feed events forwarded after cancel");
                    break;
                }
                maybe = events.recv() => {
                    let Some(event) = maybe else { break };
                    self.forward(event).await;
                }
            }
        }

        tracing::info!(
            produced = self.stats.produced(),
            failed = self.stats.failed(),
            "Feed forwarder stopped"
        );
    }

    /// Append one event.
    pub async fn forward(&self, event: MarketEvent) {
        let payload = match event.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                self.fail(&event, String::new(), e.to_string(), 0).await;
                return;
            }
        };

        let buffer = &self.buffer;
        let body = payload.as_str();
        let outcome = retry_with(self.retry, &self.cancel, BufferError::is_retryable, move |_| {
            buffer.produce(body)
        })
        .await;

        match outcome {
            RetryOutcome::Succeeded { value: id, .. } => {
                self.stats.produced.fetch_add(1, Ordering::Relaxed);
                metrics::record_produced(event.kind());
                tracing::trace!(entry_id = %id, symbol = event.symbol(), "Event buffered");
            }
            RetryOutcome::Failed { error, attempts } | RetryOutcome::Cancelled { error, attempts } => {
                metrics::record_buffer_error("produce");
                self.fail(&event, payload, error.to_string(), attempts).await;
            }
        }
    }

    async fn fail(&self, event: &MarketEvent, payload: String, reason: String, attempts: u32) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            symbol = event.symbol(),
            kind = event.kind(),
            attempts,
            reason = %reason,
            "Event could not be buffered"
        );
        let record = ErrorRecord::new(ErrorKind::Produce, payload, reason)
            .with_symbol(event.symbol())
            .with_attempts(attempts);
        self.errors.report(record).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::services::errors::error_channel;
    use crate::domain::market::Trade;
    use crate::infrastructure::memory::InMemoryStreamBuffer;
    use rust_decimal::Decimal;

    fn trade(id: i64) -> MarketEvent {
        MarketEvent::Trade(Trade {
            symbol: "ETHUSDT".to_string(),
            event_time_ms: 1_700_000_000_000,
            trade_id: id,
            price: Decimal::ONE_HUNDRED,
            quantity: Decimal::ONE,
            trade_time_ms: 1_700_000_000_000,
            buyer_is_maker: true,
        })
    }

    #[tokio::test]
    async fn forwards_events_in_order() {
        let buffer = Arc::new(InMemoryStreamBuffer::new(100, 0));
        let (reporter, _rx) = error_channel(8);
        let forwarder = FeedForwarder::new(
            buffer.clone(),
            reporter,
            RetryPolicy::new(0, Duration::ZERO),
            CancellationToken::new(),
        );
        let stats = forwarder.stats();

        let (tx, rx) = mpsc::channel(8);
        for id in 1..=3 {
            tx.send(trade(id)).await.unwrap();
        }
        drop(tx);
        forwarder.run(rx).await;

        assert_eq!(stats.produced(), 3);
        let newest = buffer.latest(3).await.unwrap();
        let ids: Vec<i64> = newest
            .iter()
            .rev()
            .map(|e| match MarketEvent::from_payload(&e.payload).unwrap() {
                MarketEvent::Trade(t) => t.trade_id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn cancel_still_forwards_queued_events() {
        let buffer = Arc::new(InMemoryStreamBuffer::new(100, 0));
        let (reporter, _rx) = error_channel(8);
        let cancel = CancellationToken::new();
        let forwarder = FeedForwarder::new(
            buffer.clone(),
            reporter,
            RetryPolicy::new(0, Duration::ZERO),
            cancel.clone(),
        );
        let stats = forwarder.stats();

        let (tx, rx) = mpsc::channel(32);
        for id in 1..=20 {
            tx.send(trade(id)).await.unwrap();
        }
        cancel.cancel();
        forwarder.run(rx).await;

        assert_eq!(stats.produced(), 20);
        assert_eq!(stats.failed(), 0);
        assert_eq!(buffer.length().await.unwrap(), 20);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn cancel_with_buffer_down_routes_queued_events() {
        let buffer = Arc::new(InMemoryStreamBuffer::new(100, 0));
        buffer.set_unavailable(true);
        let (reporter, mut rx) = error_channel(32);
        let cancel = CancellationToken::new();
        let forwarder = FeedForwarder::new(
            buffer,
            reporter,
            RetryPolicy::new(3, Duration::from_secs(60)),
            cancel.clone(),
        );
        let stats = forwarder.stats();

        let (tx, events) = mpsc::channel(32);
        for id in 1..=5 {
            tx.send(trade(id)).await.unwrap();
        }
        cancel.cancel();
        forwarder.run(events).await;

        assert_eq!(stats.produced(), 0);
        assert_eq!(stats.failed(), 5);
        for _ in 0..5 {
            assert_eq!(rx.recv().await.unwrap().kind, ErrorKind::Produce);
        }
    }

    #[tokio::test]
    async fn unavailable_buffer_routes_to_error_channel() {
        let buffer = Arc::new(InMemoryStreamBuffer::new(100, 0));
        buffer.set_unavailable(true);
        let (reporter, mut rx) = error_channel(8);
        let forwarder = FeedForwarder::new(
            buffer,
            reporter.clone(),
            RetryPolicy::new(2, Duration::from_millis(1)),
            CancellationToken::new(),
        );

        forwarder.forward(trade(9)).await;

        assert_eq!(forwarder.stats().failed(), 1);
        let record = rx.recv().await.unwrap();
        assert_eq!(record.kind, ErrorKind::Produce);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.symbol.as_deref(), Some("ETHUSDT"));
        assert!(!record.payload.is_empty());
    }
}
