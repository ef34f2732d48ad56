//! Store Writer
//!
//! Flushes batches into the record store with bounded retry and
//! acknowledges the batch's source entries only after the write succeeded.
//! When every attempt fails, each record is routed to the error channel and
//! the configured [`AckPolicy`] decides whether the entries are acknowledged
//! or left pending for redelivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::errors::ErrorReporter;
use super::retry::{RetryOutcome, RetryPolicy, retry_with};
use crate::application::ports::{RecordStore, StreamBuffer};
use crate::domain::batch::Batch;
use crate::domain::records::{ErrorKind, ErrorRecord, StoredRecord};
use crate::domain::stream::EntryId;
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// What happens to a batch's entries after every write attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Acknowledge them; the error channel now owns the records.
    #[default]
    AckAfterExhaustion,
    /// Leave them pending so the group redelivers them later.
    Redeliver,
}

impl AckPolicy {
    /// Parse from a configuration string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "redeliver" | "pending" => Self::Redeliver,
            _ => Self::AckAfterExhaustion,
        }
    }

    /// Configuration name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AckAfterExhaustion => "ack",
            Self::Redeliver => "redeliver",
        }
    }
}

/// Writer configuration.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Consumer group whose entries are acknowledged.
    pub group: String,
    /// Insert retry policy.
    pub retry: RetryPolicy,
    /// Behavior after retry exhaustion.
    pub ack_policy: AckPolicy,
}

// =============================================================================
// Outcome
// =============================================================================

/// Result of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing to write.
    Empty,
    /// The batch is durable.
    Written {
        /// Records inserted.
        records: usize,
        /// Insert attempts used.
        attempts: u32,
        /// Entries acknowledged.
        acked: u64,
    },
    /// Every attempt failed; records went to the error channel.
    Exhausted {
        /// Records routed.
        records: usize,
        /// Insert attempts used.
        attempts: u32,
        /// Entries acknowledged under the ack policy.
        acked: u64,
    },
    /// Shutdown interrupted the retries; entries stay pending.
    Abandoned {
        /// Records left unwritten.
        records: usize,
        /// Insert attempts used.
        attempts: u32,
    },
}

/// Writer counters.
#[derive(Debug, Default)]
pub struct WriterStats {
    batches_written: AtomicU64,
    records_written: AtomicU64,
    records_failed: AtomicU64,
    write_retries: AtomicU64,
    entries_acked: AtomicU64,
}

impl WriterStats {
    /// Batches made durable.
    #[must_use]
    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::Relaxed)
    }

    /// Records made durable.
    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    /// Records routed to the error channel after exhaustion.
    #[must_use]
    pub fn records_failed(&self) -> u64 {
        self.records_failed.load(Ordering::Relaxed)
    }

    /// Insert retries (attempts after the first).
    #[must_use]
    pub fn write_retries(&self) -> u64 {
        self.write_retries.load(Ordering::Relaxed)
    }

    /// Entries acknowledged.
    #[must_use]
    pub fn entries_acked(&self) -> u64 {
        self.entries_acked.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Writes batches and acknowledges their entries.
pub struct StoreWriter {
    store: Arc<dyn RecordStore>,
    buffer: Arc<dyn StreamBuffer>,
    errors: ErrorReporter,
    config: WriterConfig,
    cancel: CancellationToken,
    stats: WriterStats,
}

impl StoreWriter {
    /// Create a writer.
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        buffer: Arc<dyn StreamBuffer>,
        errors: ErrorReporter,
        config: WriterConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            buffer,
            errors,
            config,
            cancel,
            stats: WriterStats::default(),
        }
    }

    /// Writer counters.
    #[must_use]
    pub const fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Flush one batch.
    pub async fn flush(&self, batch: Batch) -> FlushOutcome {
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let started = Instant::now();
        let records = batch.len();
        let trades = batch.trades().count();
        let books = batch.books().count();
        let (first_id, last_id) = batch
            .id_range()
            .map_or((String::new(), String::new()), |(a, b)| (a.to_string(), b.to_string()));

        let store = &self.store;
        let stats = &self.stats;
        let pending_records = batch.records();
        let outcome = retry_with(
            self.config.retry,
            &self.cancel,
            |_| true,
            move |attempt| {
                if attempt > 1 {
                    stats.write_retries.fetch_add(1, Ordering::Relaxed);
                    metrics::record_write_retry();
                }
                store.insert(pending_records)
            },
        )
        .await;

        metrics::record_flush_duration(started.elapsed());

        match outcome {
            RetryOutcome::Succeeded { attempts, .. } => {
                let acked = self.ack(batch.entry_ids()).await;
                self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .records_written
                    .fetch_add(records as u64, Ordering::Relaxed);
                metrics::record_records_written(records as u64);

                tracing::info!(
                    records,
                    trades,
                    books,
                    attempts,
                    acked,
                    first_id = %first_id,
                    last_id = %last_id,
                    "Batch written"
                );

                FlushOutcome::Written {
                    records,
                    attempts,
                    acked,
                }
            }
            RetryOutcome::Failed { error, attempts } => {
                tracing::error!(
                    records,
                    trades,
                    books,
                    attempts,
                    first_id = %first_id,
                    last_id = %last_id,
                    symbols = ?batch.symbols(),
                    error = %error,
                    ack_policy = self.config.ack_policy.as_str(),
                    "Batch write exhausted retries"
                );

                let (stored, ids) = batch.into_parts();
                self.route_failed(stored, &ids, attempts, &error.to_string())
                    .await;
                self.stats
                    .records_failed
                    .fetch_add(records as u64, Ordering::Relaxed);

                let acked = match self.config.ack_policy {
                    AckPolicy::AckAfterExhaustion => self.ack(&ids).await,
                    AckPolicy::Redeliver => 0,
                };

                FlushOutcome::Exhausted {
                    records,
                    attempts,
                    acked,
                }
            }
            RetryOutcome::Cancelled { error, attempts } => {
                tracing::warn!(
                    records,
                    attempts,
                    first_id = %first_id,
                    last_id = %last_id,
                    error = %error,
                    "Shutdown during write retry, entries left pending"
                );

                FlushOutcome::Abandoned { records, attempts }
            }
        }
    }

    async fn route_failed(
        &self,
        records: Vec<StoredRecord>,
        ids: &[EntryId],
        attempts: u32,
        reason: &str,
    ) {
        for (record, id) in records.into_iter().zip(ids) {
            let payload = error_payload(&record);
            let error = ErrorRecord::new(ErrorKind::WriteExhausted, payload, reason)
                .with_entry_id(*id)
                .with_symbol(record.symbol())
                .with_attempts(attempts);
            self.errors.report(error).await;
        }
    }

    async fn ack(&self, ids: &[EntryId]) -> u64 {
        match self.buffer.ack(&self.config.group, ids).await {
            Ok(count) => {
                self.stats.entries_acked.fetch_add(count, Ordering::Relaxed);
                metrics::record_entries_acked(count);
                count
            }
            Err(e) => {
                tracing::warn!(
                    entries = ids.len(),
                    error = %e,
                    "Acknowledge failed, entries will be redelivered"
                );
                0
            }
        }
    }
}

/// JSON for the dead-letter record, or the `Debug` form when the record
/// cannot be serialized.
fn error_payload<T: serde::Serialize + std::fmt::Debug>(record: &T) -> String {
    serde_json::to_string(record).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed record could not be serialized, storing debug form");
        format!("{record:?}")
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::ports::{MockRecordStore, StoreError};
    use crate::application::services::errors::error_channel;
    use crate::domain::records::TradeRecord;
    use crate::domain::stream::GroupStart;
    use crate::infrastructure::memory::InMemoryStreamBuffer;
    use rust_decimal::Decimal;
    use tokio::sync::mpsc;

    const GROUP: &str = "writers";

    fn trade(id: i64) -> StoredRecord {
        StoredRecord::Trade(TradeRecord {
            symbol: "BTCUSDT".to_string(),
            event_type: "aggTrade".to_string(),
            event_time_ms: id,
            trade_time_ms: id,
            agg_trade_id: id,
            first_trade_id: id,
            last_trade_id: id,
            price: Decimal::ONE_HUNDRED,
            quantity: Decimal::ONE,
            is_buyer_maker: false,
        })
    }

    /// Produce `n` entries and deliver them to the group so they are pending.
    async fn pending_batch(buffer: &InMemoryStreamBuffer, n: usize) -> Batch {
        buffer.ensure_group(GROUP, GroupStart::Beginning).await.unwrap();
        for i in 0..n {
            buffer.produce(&format!("payload-{i}")).await.unwrap();
        }
        let entries = buffer
            .consume(GROUP, "c1", n, Duration::ZERO)
            .await
            .unwrap();
        let ids = entries.iter().map(|e| e.id).collect();
        let records = (1..=n).map(|i| trade(i64::try_from(i).unwrap())).collect();
        Batch::new(records, ids)
    }

    fn writer(
        store: MockRecordStore,
        buffer: Arc<InMemoryStreamBuffer>,
        max_retries: u32,
        ack_policy: AckPolicy,
    ) -> (StoreWriter, ErrorReporter, mpsc::Receiver<ErrorRecord>) {
        let (reporter, rx) = error_channel(64);
        let config = WriterConfig {
            group: GROUP.to_string(),
            retry: RetryPolicy::new(max_retries, Duration::from_millis(5)),
            ack_policy,
        };
        let writer = StoreWriter::new(
            Arc::new(store),
            buffer,
            reporter.clone(),
            config,
            CancellationToken::new(),
        );
        (writer, reporter, rx)
    }

    #[tokio::test]
    async fn success_acks_all_entries() {
        let buffer = Arc::new(InMemoryStreamBuffer::new(1000, 0));
        let batch = pending_batch(&buffer, 3).await;

        let mut store = MockRecordStore::new();
        store
            .expect_insert()
            .withf(|records| records.len() == 3)
            .times(1)
            .returning(|_| Ok(()));

        let (writer, _reporter, _rx) =
            writer(store, buffer.clone(), 3, AckPolicy::AckAfterExhaustion);
        let outcome = writer.flush(batch).await;

        assert_eq!(
            outcome,
            FlushOutcome::Written {
                records: 3,
                attempts: 1,
                acked: 3
            }
        );
        assert_eq!(buffer.pending(GROUP).await.unwrap(), 0);
        assert_eq!(writer.stats().records_written(), 3);
    }

    #[tokio::test]
    async fn entries_stay_pending_until_insert_succeeds() {
        let buffer = Arc::new(InMemoryStreamBuffer::new(1000, 0));
        let batch = pending_batch(&buffer, 2).await;
        let observer = buffer.clone();

        let mut store = MockRecordStore::new();
        let mut calls = 0;
        store.expect_insert().times(2).returning(move |_| {
            assert_eq!(observer.pending_now(GROUP), 2, "acked before durable");
            calls += 1;
            if calls == 1 {
                Err(StoreError::Connection("refused".into()))
            } else {
                Ok(())
            }
        });

        let (writer, _reporter, _rx) =
            writer(store, buffer.clone(), 2, AckPolicy::AckAfterExhaustion);
        let outcome = writer.flush(batch).await;

        assert!(matches!(outcome, FlushOutcome::Written { attempts: 2, .. }));
        assert_eq!(buffer.pending(GROUP).await.unwrap(), 0);
        assert_eq!(writer.stats().write_retries(), 1);
    }

    #[tokio::test]
    async fn exhaustion_routes_records_and_acks_by_default() {
        let buffer = Arc::new(InMemoryStreamBuffer::new(1000, 0));
        let batch = pending_batch(&buffer, 4).await;

        let mut store = MockRecordStore::new();
        store
            .expect_insert()
            .times(3)
            .returning(|_| Err(StoreError::Insert("table missing".into())));

        let (writer, reporter, mut rx) =
            writer(store, buffer.clone(), 2, AckPolicy::AckAfterExhaustion);
        let outcome = writer.flush(batch).await;

        assert_eq!(
            outcome,
            FlushOutcome::Exhausted {
                records: 4,
                attempts: 3,
                acked: 4
            }
        );
        assert_eq!(reporter.stats().routed(), 4);
        assert_eq!(buffer.pending(GROUP).await.unwrap(), 0);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, ErrorKind::WriteExhausted);
        assert_eq!(first.attempts, 3);
        assert_eq!(first.symbol.as_deref(), Some("BTCUSDT"));
    }

    #[tokio::test]
    async fn redeliver_policy_leaves_entries_pending() {
        let buffer = Arc::new(InMemoryStreamBuffer::new(1000, 0));
        let batch = pending_batch(&buffer, 2).await;

        let mut store = MockRecordStore::new();
        store
            .expect_insert()
            .times(1)
            .returning(|_| Err(StoreError::Connection("down".into())));

        let (writer, reporter, _rx) = writer(store, buffer.clone(), 0, AckPolicy::Redeliver);
        let outcome = writer.flush(batch).await;

        assert!(matches!(outcome, FlushOutcome::Exhausted { acked: 0, .. }));
        assert_eq!(reporter.stats().routed(), 2);
        assert_eq!(buffer.pending(GROUP).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_batch_is_noop() {
        let buffer = Arc::new(InMemoryStreamBuffer::new(10, 0));
        let store = MockRecordStore::new();
        let (writer, _reporter, _rx) = writer(store, buffer, 3, AckPolicy::AckAfterExhaustion);
        assert_eq!(writer.flush(Batch::default()).await, FlushOutcome::Empty);
    }

    #[test]
    fn ack_policy_parsing() {
        assert_eq!(
            AckPolicy::from_str_case_insensitive("REDELIVER"),
            AckPolicy::Redeliver
        );
        assert_eq!(
            AckPolicy::from_str_case_insensitive("ack"),
            AckPolicy::AckAfterExhaustion
        );
        assert_eq!(AckPolicy::default().as_str(), "ack");
    }

    #[derive(Debug)]
    struct Unserializable {
        symbol: &'static str,
    }

    impl serde::Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom(format!("{} not representable", self.symbol)))
        }
    }

    #[test]
    fn error_payload_falls_back_to_debug_form() {
        let payload = error_payload(&Unserializable { symbol: "BTCUSDT" });
        assert!(!payload.is_empty());
        assert!(payload.contains("Unserializable"));
        assert!(payload.contains("BTCUSDT"));
    }

    #[test]
    fn error_payload_is_json_for_records() {
        let payload = error_payload(&trade(7));
        let back: StoredRecord = serde_json::from_str(&payload).unwrap();
        assert_eq!(back, trade(7));
    }
}
