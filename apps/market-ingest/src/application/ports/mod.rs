//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `StreamBuffer`: Capped append-only log with consumer groups
//! - `RecordStore`: Bulk writes into the columnar store
//! - `RecordReader`: Read-only queries over stored records

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::records::{BookSnapshotRecord, StoredRecord, TradeRecord};
use crate::domain::stream::{ClaimResult, EntryId, GroupStart, StreamEntry, StreamInfo};

// =============================================================================
// Stream Buffer
// =============================================================================

/// Durable, length-capped stream with grouped, acknowledged consumption.
///
/// One instance is bound to one stream. Entries are delivered to a group in
/// id order and stay pending for that group until acknowledged.
#[async_trait]
pub trait StreamBuffer: Send + Sync {
    /// Create `group` if it does not exist. An existing group is not an error.
    async fn ensure_group(&self, group: &str, start: GroupStart) -> Result<(), BufferError>;

    /// Append a payload at the tail and return its id.
    ///
    /// When the retained length exceeds the cap plus slack, the oldest
    /// entries are trimmed down to the cap.
    async fn produce(&self, payload: &str) -> Result<EntryId, BufferError>;

    /// Deliver up to `batch_size` entries never delivered to `group`.
    ///
    /// Blocks up to `block_timeout` when nothing is available; a zero
    /// timeout returns immediately. Delivered entries become pending for
    /// `consumer`.
    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StreamEntry>, BufferError>;

    /// Acknowledge entries for `group`. Returns how many were pending.
    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<u64, BufferError>;

    /// Move entries pending longer than `min_idle` to `consumer`.
    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<ClaimResult, BufferError>;

    /// Retained entry count.
    async fn length(&self) -> Result<u64, BufferError>;

    /// Entries delivered to `group` but not yet acknowledged.
    async fn pending(&self, group: &str) -> Result<u64, BufferError>;

    /// Retained range and cap.
    async fn info(&self) -> Result<StreamInfo, BufferError>;

    /// Newest `count` entries, newest first.
    async fn latest(&self, count: usize) -> Result<Vec<StreamEntry>, BufferError>;

    /// Oldest entry `group` still needs: the lowest pending id or, failing
    /// that, the first entry not yet delivered. `None` when the group is
    /// fully caught up.
    async fn oldest_unacked(&self, group: &str) -> Result<Option<EntryId>, BufferError>;

    /// Remove every entry with an id below `cutoff`. Returns how many were
    /// removed.
    async fn trim_older_than(&self, cutoff: EntryId) -> Result<u64, BufferError>;
}

/// Stream buffer errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BufferError {
    /// The buffer could not be reached. Callers may retry.
    #[error("stream connection failed: {0}")]
    Connection(String),

    /// The consumer group does not exist.
    #[error("consumer group {0} does not exist")]
    NoGroup(String),

    /// An entry read back from the buffer is not usable.
    #[error("malformed stream entry {id}: {reason}")]
    MalformedEntry {
        /// Raw id as returned by the buffer.
        id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The buffer rejected a command.
    #[error("stream command failed: {0}")]
    Command(String),
}

impl BufferError {
    /// True for transient connection faults.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

// =============================================================================
// Record Store
// =============================================================================

/// Bulk writer for the columnar store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create tables if missing. Idempotent.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Insert all records in one bulk operation per table.
    async fn insert(&self, records: &[StoredRecord]) -> Result<(), StoreError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Record store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// Schema creation failed.
    #[error("schema setup failed: {0}")]
    Schema(String),

    /// A bulk insert failed.
    #[error("insert failed: {0}")]
    Insert(String),

    /// A read query failed.
    #[error("query failed: {0}")]
    Query(String),
}

// =============================================================================
// Record Reader
// =============================================================================

/// Filter for read queries. Time bounds are inclusive epoch ms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    /// Restrict to one symbol.
    pub symbol: Option<String>,
    /// Lower event-time bound.
    pub from_ms: Option<i64>,
    /// Upper event-time bound.
    pub to_ms: Option<i64>,
    /// Maximum rows returned.
    pub limit: usize,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            symbol: None,
            from_ms: None,
            to_ms: None,
            limit: 100,
        }
    }
}

impl RecordQuery {
    /// Query a single symbol.
    #[must_use]
    pub fn for_symbol(symbol: impl Into<String>) -> Self {
        Self {
            symbol: Some(symbol.into()),
            ..Self::default()
        }
    }

    /// Restrict to an event-time window.
    #[must_use]
    pub const fn between(mut self, from_ms: i64, to_ms: i64) -> Self {
        self.from_ms = Some(from_ms);
        self.to_ms = Some(to_ms);
        self
    }

    /// Restrict to events at or after `from_ms`.
    #[must_use]
    pub const fn since(mut self, from_ms: i64) -> Self {
        self.from_ms = Some(from_ms);
        self
    }

    /// Set the row limit.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Whether a record with `symbol` and `event_time_ms` passes the filter.
    #[must_use]
    pub fn matches(&self, symbol: &str, event_time_ms: i64) -> bool {
        self.symbol.as_deref().is_none_or(|s| s == symbol)
            && self.from_ms.is_none_or(|from| event_time_ms >= from)
            && self.to_ms.is_none_or(|to| event_time_ms <= to)
    }
}

/// Aggregate statistics over trades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeStats {
    /// Number of trades.
    pub count: u64,
    /// Summed quantity.
    pub volume: Decimal,
    /// Mean price.
    pub avg_price: Decimal,
    /// Lowest price.
    pub low: Decimal,
    /// Highest price.
    pub high: Decimal,
}

/// Read-only contract exposed to read collaborators.
#[async_trait]
pub trait RecordReader: Send + Sync {
    /// Trades matching `query`, newest first.
    async fn query_trades(&self, query: &RecordQuery) -> Result<Vec<TradeRecord>, StoreError>;

    /// Book snapshots matching `query`, newest first.
    async fn query_books(
        &self,
        query: &RecordQuery,
    ) -> Result<Vec<BookSnapshotRecord>, StoreError>;

    /// Statistics over trades matching `query` (limit ignored).
    /// `None` when no trade matches.
    async fn trade_stats(&self, query: &RecordQuery) -> Result<Option<TradeStats>, StoreError>;

    /// Number of trades matching `query` (limit ignored).
    async fn count_trades(&self, query: &RecordQuery) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_matches_symbol_and_window() {
        let query = RecordQuery::for_symbol("BTCUSDT").between(100, 200);
        assert!(query.matches("BTCUSDT", 100));
        assert!(query.matches("BTCUSDT", 200));
        assert!(!query.matches("BTCUSDT", 201));
        assert!(!query.matches("ETHUSDT", 150));
    }

    #[test]
    fn default_query_matches_everything() {
        let query = RecordQuery::default();
        assert!(query.matches("ANY", i64::MIN));
        assert_eq!(query.limit, 100);
    }

    #[test]
    fn only_connection_errors_are_retryable() {
        assert!(BufferError::Connection("reset".into()).is_retryable());
        assert!(!BufferError::NoGroup("g".into()).is_retryable());
        assert!(!BufferError::Command("WRONGTYPE".into()).is_retryable());
    }
}
