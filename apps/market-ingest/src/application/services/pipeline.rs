//! Pipeline Assembly
//!
//! Starts every stage over one stream buffer and one record store, and
//! stops them in an order that loses nothing already buffered:
//!
//! ```text
//! cancel ─► forwarder, consumer, flush timer stop
//!        ─► final flush of the accumulator
//!        ─► error drain persists what is queued, then stops
//! ```

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::consumer::{ConsumerConfig, StreamConsumer};
use super::errors::{ErrorChannelStats, ErrorDrain, error_channel};
use super::forwarder::{FeedForwarder, ForwarderStats};
use super::retry::RetryPolicy;
use super::writer::{AckPolicy, FlushOutcome, StoreWriter, WriterConfig};
use crate::application::ports::{BufferError, RecordStore, StoreError, StreamBuffer};
use crate::domain::market::MarketEvent;

// =============================================================================
// Configuration
// =============================================================================

/// Settings for every pipeline stage.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Consume loop and accumulator settings.
    pub consumer: ConsumerConfig,
    /// Retry policy for store inserts.
    pub write_retry: RetryPolicy,
    /// Retry policy for buffer appends.
    pub produce_retry: RetryPolicy,
    /// Behavior after insert retries are exhausted.
    pub ack_policy: AckPolicy,
    /// Error channel capacity.
    pub error_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            consumer: ConsumerConfig::default(),
            write_retry: RetryPolicy::default(),
            produce_retry: RetryPolicy::default(),
            ack_policy: AckPolicy::default(),
            error_capacity: 1024,
        }
    }
}

/// Everything the pipeline runs against.
pub struct PipelineContext {
    /// Main stream buffer.
    pub buffer: Arc<dyn StreamBuffer>,
    /// Stream receiving error records.
    pub dead_letters: Arc<dyn StreamBuffer>,
    /// Record store.
    pub store: Arc<dyn RecordStore>,
    /// Stage settings.
    pub settings: PipelineSettings,
    /// Shutdown signal.
    pub cancel: CancellationToken,
}

/// Errors raised while starting the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The consumer group could not be created.
    #[error("stream buffer setup failed: {0}")]
    Buffer(#[from] BufferError),

    /// The store schema could not be created.
    #[error("record store setup failed: {0}")]
    Store(#[from] StoreError),
}

// =============================================================================
// Stats
// =============================================================================

/// Point-in-time counters across all stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Events appended to the buffer.
    pub produced: u64,
    /// Events that could not be appended.
    pub produce_failures: u64,
    /// Entries delivered to the consumer.
    pub entries_read: u64,
    /// Entries reclaimed from stale consumers.
    pub entries_claimed: u64,
    /// Entries whose payload failed to transform.
    pub transform_failures: u64,
    /// Failed buffer reads.
    pub read_errors: u64,
    /// Records waiting in the accumulator.
    pub buffered: usize,
    /// Batches made durable.
    pub batches_written: u64,
    /// Records made durable.
    pub records_written: u64,
    /// Records routed after write exhaustion.
    pub records_failed: u64,
    /// Insert retries.
    pub write_retries: u64,
    /// Entries acknowledged after a write.
    pub entries_acked: u64,
    /// Records handed to the error channel.
    pub errors_routed: u64,
    /// Error records persisted to the dead-letter stream.
    pub errors_persisted: u64,
    /// Error records that could only be logged.
    pub error_persist_failures: u64,
}

/// Cloneable read-only view of a running pipeline.
#[derive(Clone)]
pub struct PipelineMonitor {
    consumer: Arc<StreamConsumer>,
    writer: Arc<StoreWriter>,
    forwarder: Arc<ForwarderStats>,
    errors: Arc<ErrorChannelStats>,
}

impl PipelineMonitor {
    /// Current counters.
    #[must_use]
    pub fn snapshot(&self) -> PipelineStats {
        let consumer = self.consumer.stats();
        let writer = self.writer.stats();
        PipelineStats {
            produced: self.forwarder.produced(),
            produce_failures: self.forwarder.failed(),
            entries_read: consumer.entries_read(),
            entries_claimed: consumer.entries_claimed(),
            transform_failures: consumer.transform_failures(),
            read_errors: consumer.read_errors(),
            buffered: self.consumer.buffered(),
            batches_written: writer.batches_written(),
            records_written: writer.records_written(),
            records_failed: writer.records_failed(),
            write_retries: writer.write_retries(),
            entries_acked: writer.entries_acked(),
            errors_routed: self.errors.routed(),
            errors_persisted: self.errors.persisted(),
            error_persist_failures: self.errors.persist_failures(),
        }
    }
}

/// Summary returned by [`Pipeline::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Result of the final flush.
    pub final_flush: FlushOutcome,
    /// Counters after every stage stopped.
    pub stats: PipelineStats,
}

// =============================================================================
// Pipeline
// =============================================================================

/// Running pipeline.
pub struct Pipeline {
    cancel: CancellationToken,
    drain_stop: CancellationToken,
    consumer: Arc<StreamConsumer>,
    monitor: PipelineMonitor,
    forwarder_task: JoinHandle<()>,
    consumer_task: JoinHandle<()>,
    timer_task: JoinHandle<()>,
    drain_task: JoinHandle<()>,
}

impl Pipeline {
    /// Prepare the buffer and store, then spawn every stage.
    ///
    /// `events` is the receiving side of the feed client's event channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer group or the store schema cannot
    /// be created.
    pub async fn start(
        ctx: PipelineContext,
        events: mpsc::Receiver<MarketEvent>,
    ) -> Result<Self, PipelineError> {
        let PipelineContext {
            buffer,
            dead_letters,
            store,
            settings,
            cancel,
        } = ctx;

        buffer
            .ensure_group(&settings.consumer.group, settings.consumer.group_start)
            .await?;
        store.ensure_schema().await?;

        let (reporter, error_rx) = error_channel(settings.error_capacity);

        let drain_stop = CancellationToken::new();
        let drain_task = tokio::spawn(
            ErrorDrain::new(error_rx, dead_letters, &reporter, drain_stop.clone()).run(),
        );

        let writer = Arc::new(StoreWriter::new(
            store,
            Arc::clone(&buffer),
            reporter.clone(),
            WriterConfig {
                group: settings.consumer.group.clone(),
                retry: settings.write_retry,
                ack_policy: settings.ack_policy,
            },
            cancel.clone(),
        ));

        let consumer = Arc::new(StreamConsumer::new(
            Arc::clone(&buffer),
            Arc::clone(&writer),
            reporter.clone(),
            settings.consumer.clone(),
            cancel.clone(),
        ));

        let forwarder = FeedForwarder::new(
            buffer,
            reporter.clone(),
            settings.produce_retry,
            cancel.clone(),
        );

        let monitor = PipelineMonitor {
            consumer: Arc::clone(&consumer),
            writer,
            forwarder: forwarder.stats(),
            errors: reporter.stats(),
        };

        let forwarder_task = tokio::spawn(forwarder.run(events));
        let consumer_task = tokio::spawn(Arc::clone(&consumer).run());
        let timer_task = tokio::spawn(Arc::clone(&consumer).run_flush_timer());

        tracing::info!(
            group = %settings.consumer.group,
            consumer = %settings.consumer.consumer,
            flush_threshold = settings.consumer.flush_threshold,
            flush_interval_ms = settings.consumer.flush_interval.as_millis(),
            max_retries = settings.write_retry.max_retries,
            ack_policy = settings.ack_policy.as_str(),
            "Pipeline started"
        );

        Ok(Self {
            cancel,
            drain_stop,
            consumer,
            monitor,
            forwarder_task,
            consumer_task,
            timer_task,
            drain_task,
        })
    }

    /// Read-only view for health and metrics.
    #[must_use]
    pub fn monitor(&self) -> PipelineMonitor {
        self.monitor.clone()
    }

    /// Stop every stage, flush what is buffered and drain the error channel.
    pub async fn shutdown(self) -> PipelineReport {
        self.cancel.cancel();

        let joined = join_all([self.forwarder_task, self.consumer_task, self.timer_task]).await;
        for (name, result) in ["forwarder", "consumer", "flush_timer"].into_iter().zip(joined) {
            if let Err(e) = result {
                tracing::error!(task = name, error = %e, "Pipeline task failed");
            }
        }

        let final_flush = self.consumer.flush_now().await;
        tracing::info!(outcome = ?final_flush, "Final flush complete");

        self.drain_stop.cancel();
        if let Err(e) = self.drain_task.await {
            tracing::error!(task = "error_drain", error = %e, "Pipeline task failed");
        }

        let stats = self.monitor.snapshot();
        tracing::info!(
            produced = stats.produced,
            records_written = stats.records_written,
            errors_routed = stats.errors_routed,
            "Pipeline stopped"
        );

        PipelineReport { final_flush, stats }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::market::AggTrade;
    use crate::infrastructure::memory::{InMemoryRecordStore, InMemoryStreamBuffer};
    use rust_decimal::Decimal;

    fn agg(id: i64) -> MarketEvent {
        MarketEvent::AggTrade(AggTrade {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: 1_700_000_000_000 + id,
            agg_trade_id: id,
            price: Decimal::ONE_HUNDRED,
            quantity: Decimal::ONE,
            first_trade_id: id,
            last_trade_id: id,
            trade_time_ms: 1_700_000_000_000 + id,
            buyer_is_maker: false,
        })
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            consumer: ConsumerConfig {
                group: "g".to_string(),
                consumer: "c".to_string(),
                block_timeout: Duration::from_millis(20),
                flush_interval: Duration::from_secs(3600),
                ..ConsumerConfig::default()
            },
            write_retry: RetryPolicy::new(0, Duration::from_millis(1)),
            produce_retry: RetryPolicy::new(0, Duration::from_millis(1)),
            ..PipelineSettings::default()
        }
    }

    #[tokio::test]
    async fn shutdown_flushes_partial_batch() {
        let buffer = Arc::new(InMemoryStreamBuffer::new(1000, 0));
        let store = Arc::new(InMemoryRecordStore::new());
        let (tx, rx) = mpsc::channel(16);

        let pipeline = Pipeline::start(
            PipelineContext {
                buffer: buffer.clone(),
                dead_letters: Arc::new(InMemoryStreamBuffer::new(100, 0)),
                store: store.clone(),
                settings: settings(),
                cancel: CancellationToken::new(),
            },
            rx,
        )
        .await
        .unwrap();
        let monitor = pipeline.monitor();

        for id in 1..=5 {
            tx.send(agg(id)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while monitor.snapshot().buffered < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(store.trades().is_empty());

        let report = pipeline.shutdown().await;

        assert!(matches!(
            report.final_flush,
            FlushOutcome::Written { records: 5, .. }
        ));
        assert_eq!(report.stats.produced, 5);
        assert_eq!(report.stats.records_written, 5);
        assert_eq!(store.trades().len(), 5);
        assert_eq!(buffer.pending("g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn start_fails_when_schema_cannot_be_created() {
        let store = Arc::new(InMemoryRecordStore::new());
        store.set_unavailable(true);
        let (_tx, rx) = mpsc::channel(1);

        let result = Pipeline::start(
            PipelineContext {
                buffer: Arc::new(InMemoryStreamBuffer::new(10, 0)),
                dead_letters: Arc::new(InMemoryStreamBuffer::new(10, 0)),
                store,
                settings: settings(),
                cancel: CancellationToken::new(),
            },
            rx,
        )
        .await;

        assert!(matches!(result, Err(PipelineError::Store(_))));
    }
}
