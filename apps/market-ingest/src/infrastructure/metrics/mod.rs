//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Feed**: Messages received by type, reconnects, connection state
//! - **Buffer**: Appends, claims, acknowledgements, backlog gauges
//! - **Writer**: Records written, retries, flush latency
//! - **Errors**: Records routed to the error channel by kind
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::records::ErrorKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Feed
    describe_counter!(
        "market_ingest_feed_messages_total",
        "Messages received from the exchange feed by type"
    );
    describe_counter!(
        "market_ingest_feed_reconnects_total",
        "Feed reconnections by reason"
    );
    describe_counter!(
        "market_ingest_feed_errors_total",
        "Feed WebSocket errors by type"
    );
    describe_gauge!(
        "market_ingest_feed_connected",
        "1 while the feed connection is open"
    );

    // Buffer
    describe_counter!(
        "market_ingest_entries_produced_total",
        "Events appended to the stream buffer"
    );
    describe_counter!(
        "market_ingest_entries_acked_total",
        "Stream entries acknowledged"
    );
    describe_counter!(
        "market_ingest_entries_claimed_total",
        "Stale pending entries claimed from other consumers"
    );
    describe_counter!(
        "market_ingest_entries_pruned_total",
        "Acknowledged entries removed by age"
    );
    describe_counter!(
        "market_ingest_buffer_errors_total",
        "Stream buffer operation failures"
    );
    describe_gauge!(
        "market_ingest_stream_length",
        "Entries retained in the stream buffer"
    );
    describe_gauge!(
        "market_ingest_pending_entries",
        "Entries delivered to the group but not acknowledged"
    );
    describe_gauge!(
        "market_ingest_accumulator_records",
        "Records waiting in the batch accumulator"
    );

    // Writer
    describe_counter!(
        "market_ingest_records_written_total",
        "Records written to the columnar store"
    );
    describe_counter!(
        "market_ingest_write_retries_total",
        "Store insert retries"
    );
    describe_histogram!(
        "market_ingest_flush_duration_seconds",
        "Time to flush one batch including retries"
    );

    // Errors
    describe_counter!(
        "market_ingest_errors_routed_total",
        "Records routed to the error channel by kind"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Metric labels for feed message types.
#[derive(Debug, Clone, Copy)]
pub enum FeedMessageType {
    /// Aggregated trade.
    AggTrade,
    /// Single trade.
    Trade,
    /// Depth update.
    Depth,
    /// Subscription response or other control frame.
    Control,
    /// Known event type that is not stored.
    Ignored,
    /// Well-formed event of a type we do not recognize.
    Unsupported,
    /// Frame that could not be decoded.
    Malformed,
}

impl FeedMessageType {
    const fn as_str(self) -> &'static str {
        match self {
            Self::AggTrade => "agg_trade",
            Self::Trade => "trade",
            Self::Depth => "depth",
            Self::Control => "control",
            Self::Ignored => "ignored",
            Self::Unsupported => "unsupported",
            Self::Malformed => "malformed",
        }
    }
}

/// Metric labels for reconnect reasons.
#[derive(Debug, Clone, Copy)]
pub enum ReconnectReason {
    /// The connection failed or timed out.
    Fault,
    /// The connection reached its maximum age.
    Rotation,
}

impl ReconnectReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Fault => "fault",
            Self::Rotation => "rotation",
        }
    }
}

// =============================================================================
// Feed Metrics
// =============================================================================

/// Record a message received from the feed.
pub fn record_feed_message(msg_type: FeedMessageType) {
    counter!(
        "market_ingest_feed_messages_total",
        "message_type" => msg_type.as_str()
    )
    .increment(1);
}

/// Record a feed reconnection.
pub fn record_reconnect(reason: ReconnectReason) {
    counter!(
        "market_ingest_feed_reconnects_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a feed WebSocket error.
pub fn record_feed_error(error_type: &'static str) {
    counter!(
        "market_ingest_feed_errors_total",
        "error_type" => error_type
    )
    .increment(1);
}

/// Update the feed connection gauge.
pub fn set_feed_connected(connected: bool) {
    gauge!("market_ingest_feed_connected").set(if connected { 1.0 } else { 0.0 });
}

// =============================================================================
// Buffer Metrics
// =============================================================================

/// Record an event appended to the buffer.
pub fn record_produced(kind: &'static str) {
    counter!("market_ingest_entries_produced_total", "kind" => kind).increment(1);
}

/// Record acknowledged entries.
pub fn record_entries_acked(count: u64) {
    counter!("market_ingest_entries_acked_total").increment(count);
}

/// Record claimed entries.
pub fn record_entries_claimed(count: u64) {
    counter!("market_ingest_entries_claimed_total").increment(count);
}

/// Record entries removed by age trimming.
pub fn record_entries_pruned(count: u64) {
    counter!("market_ingest_entries_pruned_total").increment(count);
}

/// Record a failed buffer operation.
pub fn record_buffer_error(operation: &'static str) {
    counter!("market_ingest_buffer_errors_total", "operation" => operation).increment(1);
}

/// Update the backlog gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_stream_backlog(length: u64, pending: u64) {
    gauge!("market_ingest_stream_length").set(length as f64);
    gauge!("market_ingest_pending_entries").set(pending as f64);
}

/// Update the accumulator gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_accumulator_records(count: usize) {
    gauge!("market_ingest_accumulator_records").set(count as f64);
}

// =============================================================================
// Writer Metrics
// =============================================================================

/// Record records made durable.
pub fn record_records_written(count: u64) {
    counter!("market_ingest_records_written_total").increment(count);
}

/// Record one insert retry.
pub fn record_write_retry() {
    counter!("market_ingest_write_retries_total").increment(1);
}

/// Record flush duration.
pub fn record_flush_duration(duration: Duration) {
    histogram!("market_ingest_flush_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Error Channel Metrics
// =============================================================================

/// Record a record routed to the error channel.
pub fn record_error_routed(kind: ErrorKind) {
    counter!("market_ingest_errors_routed_total", "kind" => kind.as_str()).increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_message_type_as_str() {
        assert_eq!(FeedMessageType::AggTrade.as_str(), "agg_trade");
        assert_eq!(FeedMessageType::Control.as_str(), "control");
        assert_eq!(FeedMessageType::Malformed.as_str(), "malformed");
        assert_eq!(FeedMessageType::Ignored.as_str(), "ignored");
    }

    #[test]
    fn reconnect_reason_as_str() {
        assert_eq!(ReconnectReason::Fault.as_str(), "fault");
        assert_eq!(ReconnectReason::Rotation.as_str(), "rotation");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_feed_message(FeedMessageType::Trade);
        record_entries_acked(3);
        set_stream_backlog(10, 2);
        record_flush_duration(Duration::from_millis(5));
    }
}
