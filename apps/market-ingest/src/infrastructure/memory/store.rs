//! In-memory record store.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::application::ports::{RecordQuery, RecordReader, RecordStore, StoreError, TradeStats};
use crate::domain::records::{BookSnapshotRecord, StoredRecord, TradeRecord};

/// In-memory implementation of `RecordStore` and `RecordReader`.
///
/// Suitable for local runs and tests. Rows live only as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    trades: RwLock<Vec<TradeRecord>>,
    books: RwLock<Vec<BookSnapshotRecord>>,
    batch_sizes: RwLock<Vec<usize>>,
    insert_attempts: AtomicU64,
    fail_next: AtomicU32,
    unavailable: AtomicBool,
    schema_ready: AtomicBool,
}

impl InMemoryRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` inserts with a connection error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every operation until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Inserts attempted, failed ones included.
    #[must_use]
    pub fn insert_attempts(&self) -> u64 {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    /// Size of every successful insert, in order.
    #[must_use]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.read().clone()
    }

    /// Stored trades in insertion order.
    #[must_use]
    pub fn trades(&self) -> Vec<TradeRecord> {
        self.trades.read().clone()
    }

    /// Stored book snapshots in insertion order.
    #[must_use]
    pub fn books(&self) -> Vec<BookSnapshotRecord> {
        self.books.read().clone()
    }

    /// Whether `ensure_schema` has succeeded.
    #[must_use]
    pub fn schema_ready(&self) -> bool {
        self.schema_ready.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("store unavailable".to_string()));
        }
        Ok(())
    }

    fn matching_trades(&self, query: &RecordQuery) -> Vec<TradeRecord> {
        let mut trades: Vec<TradeRecord> = self
            .trades
            .read()
            .iter()
            .filter(|t| query.matches(&t.symbol, t.event_time_ms))
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.event_time_ms.cmp(&a.event_time_ms));
        trades
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.check_available()
            .map_err(|e| StoreError::Schema(e.to_string()))?;
        self.schema_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn insert(&self, records: &[StoredRecord]) -> Result<(), StoreError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Connection("injected failure".to_string()));
        }

        let mut trades = self.trades.write();
        let mut books = self.books.write();
        for record in records {
            match record {
                StoredRecord::Trade(t) => trades.push(t.clone()),
                StoredRecord::Book(b) => books.push(b.clone()),
            }
        }
        self.batch_sizes.write().push(records.len());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[async_trait]
impl RecordReader for InMemoryRecordStore {
    async fn query_trades(&self, query: &RecordQuery) -> Result<Vec<TradeRecord>, StoreError> {
        self.check_available()?;
        let mut trades = self.matching_trades(query);
        trades.truncate(query.limit);
        Ok(trades)
    }

    async fn query_books(
        &self,
        query: &RecordQuery,
    ) -> Result<Vec<BookSnapshotRecord>, StoreError> {
        self.check_available()?;
        let mut books: Vec<BookSnapshotRecord> = self
            .books
            .read()
            .iter()
            .filter(|b| query.matches(&b.symbol, b.event_time_ms))
            .cloned()
            .collect();
        books.sort_by(|a, b| b.event_time_ms.cmp(&a.event_time_ms));
        books.truncate(query.limit);
        Ok(books)
    }

    async fn trade_stats(&self, query: &RecordQuery) -> Result<Option<TradeStats>, StoreError> {
        self.check_available()?;
        let trades = self.matching_trades(query);
        let Some(first) = trades.first() else {
            return Ok(None);
        };

        let mut volume = Decimal::ZERO;
        let mut price_sum = Decimal::ZERO;
        let mut low = first.price;
        let mut high = first.price;
        for trade in &trades {
            volume += trade.quantity;
            price_sum += trade.price;
            low = low.min(trade.price);
            high = high.max(trade.price);
        }
        let count = trades.len() as u64;

        Ok(Some(TradeStats {
            count,
            volume,
            avg_price: price_sum / Decimal::from(count),
            low,
            high,
        }))
    }

    async fn count_trades(&self, query: &RecordQuery) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self
            .trades
            .read()
            .iter()
            .filter(|t| query.matches(&t.symbol, t.event_time_ms))
            .count() as u64)
    }
}
