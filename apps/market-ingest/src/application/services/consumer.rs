//! Stream Consumer
//!
//! Reads entries from the buffer through a consumer group, transforms each
//! payload into a store record and feeds the batch accumulator. A batch is
//! flushed when it reaches the size threshold, or by the flush timer when
//! records have been waiting for a full interval.
//!
//! Entries whose payload cannot be transformed are routed to the error
//! channel and acknowledged straight away. Entries left pending by a
//! consumer that died are reclaimed after `pending_timeout`.
//!
//! With a retention window set, the claim tick also removes entries older
//! than the window. The cut never passes the oldest entry the group still
//! needs, so age pruning only drops acknowledged data.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::errors::ErrorReporter;
use super::transform::{payload_symbol, transform_payload};
use super::writer::{FlushOutcome, StoreWriter};
use crate::application::ports::{BufferError, StreamBuffer};
use crate::domain::batch::{Batch, BatchAccumulator};
use crate::domain::records::{ErrorKind, ErrorRecord};
use crate::domain::stream::{EntryId, GroupStart, StreamEntry};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer group name.
    pub group: String,
    /// This consumer's name within the group.
    pub consumer: String,
    /// Where a newly created group starts reading.
    pub group_start: GroupStart,
    /// Entries requested per read.
    pub batch_size: usize,
    /// How long a read blocks when nothing is available.
    pub block_timeout: Duration,
    /// Records per batch before a size-triggered flush.
    pub flush_threshold: usize,
    /// Maximum time records wait before a timed flush.
    pub flush_interval: Duration,
    /// Idle time after which another consumer's pending entries are claimed.
    pub pending_timeout: Duration,
    /// How often stale pending entries are checked.
    pub claim_interval: Duration,
    /// Pause after a failed read.
    pub retry_delay: Duration,
    /// Age after which acknowledged entries are pruned. `None` keeps them
    /// until the length cap trims them.
    pub retention: Option<Duration>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: "trades_read_group".to_string(),
            consumer: "ingest".to_string(),
            group_start: GroupStart::Beginning,
            batch_size: 100,
            block_timeout: Duration::from_secs(1),
            flush_threshold: 100,
            flush_interval: Duration::from_secs(5),
            pending_timeout: Duration::from_secs(60),
            claim_interval: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            retention: None,
        }
    }
}

/// Consumer counters.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    entries_read: AtomicU64,
    entries_claimed: AtomicU64,
    transform_failures: AtomicU64,
    read_errors: AtomicU64,
    entries_pruned: AtomicU64,
}

impl ConsumerStats {
    /// Entries delivered by reads and claims.
    #[must_use]
    pub fn entries_read(&self) -> u64 {
        self.entries_read.load(Ordering::Relaxed)
    }

    /// Entries taken over from stale consumers.
    #[must_use]
    pub fn entries_claimed(&self) -> u64 {
        self.entries_claimed.load(Ordering::Relaxed)
    }

    /// Entries whose payload could not be transformed.
    #[must_use]
    pub fn transform_failures(&self) -> u64 {
        self.transform_failures.load(Ordering::Relaxed)
    }

    /// Failed reads.
    #[must_use]
    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }

    /// Entries removed by age pruning.
    #[must_use]
    pub fn entries_pruned(&self) -> u64 {
        self.entries_pruned.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// Consume loop plus flush timer over one accumulator.
pub struct StreamConsumer {
    buffer: Arc<dyn StreamBuffer>,
    writer: Arc<StoreWriter>,
    accumulator: Mutex<BatchAccumulator>,
    errors: ErrorReporter,
    config: ConsumerConfig,
    cancel: CancellationToken,
    stats: ConsumerStats,
}

impl StreamConsumer {
    /// Create a consumer.
    #[must_use]
    pub fn new(
        buffer: Arc<dyn StreamBuffer>,
        writer: Arc<StoreWriter>,
        errors: ErrorReporter,
        config: ConsumerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let accumulator = Mutex::new(BatchAccumulator::new(config.flush_threshold));
        Self {
            buffer,
            writer,
            accumulator,
            errors,
            config,
            cancel,
            stats: ConsumerStats::default(),
        }
    }

    /// Consumer counters.
    #[must_use]
    pub const fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    /// Records waiting in the accumulator.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.accumulator.lock().len()
    }

    /// Run the consume loop until cancelled.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            group = %self.config.group,
            consumer = %self.config.consumer,
            batch_size = self.config.batch_size,
            flush_threshold = self.config.flush_threshold,
            "Stream consumer started"
        );

        let mut next_claim = Instant::now();

        while !self.cancel.is_cancelled() {
            if Instant::now() >= next_claim {
                self.claim_stale().await;
                if let Some(retention) = self.config.retention {
                    self.prune_expired(retention).await;
                }
                next_claim = Instant::now() + self.config.claim_interval;
            }

            let read = tokio::select! {
                () = self.cancel.cancelled() => break,
                read = self.buffer.consume(
                    &self.config.group,
                    &self.config.consumer,
                    self.config.batch_size,
                    self.config.block_timeout,
                ) => read,
            };

            match read {
                Ok(entries) if entries.is_empty() => {}
                Ok(entries) => {
                    self.stats
                        .entries_read
                        .fetch_add(entries.len() as u64, Ordering::Relaxed);
                    self.process_entries(entries).await;
                }
                Err(e) => self.handle_read_error(e).await,
            }
        }

        tracing::info!(
            consumer = %self.config.consumer,
            buffered = self.buffered(),
            "Stream consumer stopped"
        );
    }

    /// Flush whatever is buffered when the interval elapses.
    ///
    /// The first tick fires one full interval after start.
    pub async fn run_flush_timer(self: Arc<Self>) {
        let period = self.config.flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let FlushOutcome::Written { records, .. } = self.flush_now().await {
                        tracing::debug!(records, "Timed flush");
                    }
                }
            }
        }
    }

    /// Flush the current accumulator contents regardless of size.
    pub async fn flush_now(&self) -> FlushOutcome {
        let batch = self.accumulator.lock().take();
        match batch {
            Some(batch) => self.writer.flush(batch).await,
            None => FlushOutcome::Empty,
        }
    }

    /// Transform delivered entries and flush any batch that filled up.
    pub async fn process_entries(&self, entries: Vec<StreamEntry>) {
        let mut rejected = Vec::new();
        let mut full: Vec<Batch> = Vec::new();

        {
            let mut accumulator = self.accumulator.lock();
            for entry in entries {
                match transform_payload(&entry.payload) {
                    Ok(record) => {
                        if let Some(batch) = accumulator.push(entry.id, record) {
                            full.push(batch);
                        }
                    }
                    Err(e) => rejected.push((entry, e.to_string())),
                }
            }
        }

        if !rejected.is_empty() {
            self.reject(rejected).await;
        }

        for batch in full {
            self.writer.flush(batch).await;
        }
    }

    async fn reject(&self, rejected: Vec<(StreamEntry, String)>) {
        let mut ids: Vec<EntryId> = Vec::with_capacity(rejected.len());

        for (entry, reason) in rejected {
            self.stats.transform_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(entry_id = %entry.id, reason = %reason, "Entry failed transform");

            let mut record = ErrorRecord::new(ErrorKind::Transform, entry.payload.as_str(), reason)
                .with_entry_id(entry.id);
            if let Some(symbol) = payload_symbol(&entry.payload) {
                record = record.with_symbol(symbol);
            }
            self.errors.report(record).await;
            ids.push(entry.id);
        }

        match self.buffer.ack(&self.config.group, &ids).await {
            Ok(acked) => metrics::record_entries_acked(acked),
            Err(e) => tracing::warn!(
                error = %e,
                count = ids.len(),
                "Failed to acknowledge rejected entries; they will be redelivered"
            ),
        }
    }

    async fn claim_stale(&self) {
        let claimed = self
            .buffer
            .claim_stale(
                &self.config.group,
                &self.config.consumer,
                self.config.pending_timeout,
                self.config.batch_size,
            )
            .await;

        match claimed {
            Ok(result) if result.is_empty() => {}
            Ok(result) => {
                if !result.deleted.is_empty() {
                    tracing::warn!(
                        count = result.deleted.len(),
                        "Pending entries were trimmed before they could be claimed"
                    );
                }
                let count = result.entries.len() as u64;
                if count > 0 {
                    tracing::info!(count, "Claimed stale pending entries");
                    self.stats.entries_claimed.fetch_add(count, Ordering::Relaxed);
                    self.stats.entries_read.fetch_add(count, Ordering::Relaxed);
                    metrics::record_entries_claimed(count);
                    self.process_entries(result.entries).await;
                }
            }
            Err(e) => self.handle_read_error(e).await,
        }
    }

    /// Remove entries older than `retention` that the group no longer needs.
    ///
    /// Returns how many entries were removed. Failures are logged and
    /// retried on the next claim tick.
    pub async fn prune_expired(&self, retention: Duration) -> u64 {
        let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
        let mut cutoff = EntryId::new(now_ms.saturating_sub(retention_ms), 0);

        match self.buffer.oldest_unacked(&self.config.group).await {
            Ok(Some(oldest)) => cutoff = cutoff.min(oldest),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Skipping age prune, group position unknown");
                return 0;
            }
        }

        match self.buffer.trim_older_than(cutoff).await {
            Ok(0) => 0,
            Ok(removed) => {
                self.stats.entries_pruned.fetch_add(removed, Ordering::Relaxed);
                metrics::record_entries_pruned(removed);
                tracing::info!(removed, cutoff = %cutoff, "Pruned expired entries");
                removed
            }
            Err(e) => {
                metrics::record_buffer_error("prune");
                tracing::warn!(error = %e, "Age prune failed");
                0
            }
        }
    }

    async fn handle_read_error(&self, error: BufferError) {
        self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_buffer_error("consume");

        if let BufferError::NoGroup(group) = &error {
            tracing::warn!(group = %group, "Consumer group missing, recreating");
            if let Err(e) = self
                .buffer
                .ensure_group(&self.config.group, self.config.group_start)
                .await
            {
                tracing::error!(error = %e, "Failed to recreate consumer group");
            }
        } else {
            tracing::warn!(
                error = %error,
                retry_delay_ms = self.config.retry_delay.as_millis(),
                "Stream read failed"
            );
        }

        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = tokio::time::sleep(self.config.retry_delay) => {}
        }
    }
}
