//! Error Channel
//!
//! Records that fail validation, buffering, or every write attempt are sent
//! here instead of being dropped. A drain worker persists them to a
//! dead-letter stream and logs each one with its replay context. If the
//! dead-letter stream is unreachable the record is logged at error level,
//! which keeps it recoverable from the logs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::StreamBuffer;
use crate::domain::records::ErrorRecord;
use crate::infrastructure::metrics;

// =============================================================================
// Counters
// =============================================================================

/// Counters shared by the reporters and the drain worker.
#[derive(Debug, Default)]
pub struct ErrorChannelStats {
    routed: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
}

impl ErrorChannelStats {
    /// Records handed to the channel.
    #[must_use]
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    /// Records written to the dead-letter stream.
    #[must_use]
    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    /// Records that could only be logged.
    #[must_use]
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Reporter
// =============================================================================

/// Cloneable sending side of the error channel.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<ErrorRecord>,
    stats: Arc<ErrorChannelStats>,
}

impl ErrorReporter {
    /// Route a record to the error channel.
    pub async fn report(&self, record: ErrorRecord) {
        self.stats.routed.fetch_add(1, Ordering::Relaxed);
        metrics::record_error_routed(record.kind);

        if let Err(mpsc::error::SendError(record)) = self.tx.send(record).await {
            self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
            log_unpersisted(&record, "error channel closed");
        }
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<ErrorChannelStats> {
        Arc::clone(&self.stats)
    }
}

/// Create the error channel.
#[must_use]
pub fn error_channel(capacity: usize) -> (ErrorReporter, mpsc::Receiver<ErrorRecord>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let reporter = ErrorReporter {
        tx,
        stats: Arc::new(ErrorChannelStats::default()),
    };
    (reporter, rx)
}

// =============================================================================
// Drain Worker
// =============================================================================

/// Persists error records to the dead-letter stream.
pub struct ErrorDrain {
    rx: mpsc::Receiver<ErrorRecord>,
    dead_letters: Arc<dyn StreamBuffer>,
    stats: Arc<ErrorChannelStats>,
    stop: CancellationToken,
}

impl ErrorDrain {
    /// Create a drain worker.
    ///
    /// `stop` ends the worker once everything already queued is persisted.
    #[must_use]
    pub fn new(
        rx: mpsc::Receiver<ErrorRecord>,
        dead_letters: Arc<dyn StreamBuffer>,
        reporter: &ErrorReporter,
        stop: CancellationToken,
    ) -> Self {
        Self {
            rx,
            dead_letters,
            stats: reporter.stats(),
            stop,
        }
    }

    /// Run until stopped or every reporter is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                maybe = self.rx.recv() => {
                    let Some(record) = maybe else { break };
                    self.persist(record).await;
                }
                () = self.stop.cancelled() => {
                    self.rx.close();
                    while let Some(record) = self.rx.recv().await {
                        self.persist(record).await;
                    }
                    break;
                }
            }
        }

        tracing::info!(
            routed = self.stats.routed(),
            persisted = self.stats.persisted(),
            persist_failures = self.stats.persist_failures(),
            "Error channel drained"
        );
    }

    async fn persist(&self, record: ErrorRecord) {
        tracing::warn!(
            kind = record.kind.as_str(),
            entry_id = ?record.entry_id.map(|id| id.to_string()),
            symbol = ?record.symbol,
            attempts = record.attempts,
            reason = %record.reason,
            "Record routed to error channel"
        );

        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                log_unpersisted(&record, &e.to_string());
                return;
            }
        };

        match self.dead_letters.produce(&json).await {
            Ok(id) => {
                self.stats.persisted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(dead_letter_id = %id, "Error record persisted");
            }
            Err(e) => {
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                log_unpersisted(&record, &e.to_string());
            }
        }
    }
}

fn log_unpersisted(record: &ErrorRecord, cause: &str) {
    tracing::error!(
        kind = record.kind.as_str(),
        entry_id = ?record.entry_id.map(|id| id.to_string()),
        symbol = ?record.symbol,
        attempts = record.attempts,
        reason = %record.reason,
        payload = %record.payload,
        cause,
        "Error record could not be persisted"
    );
}
