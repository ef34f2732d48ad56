//! Batch Accumulation
//!
//! Records are grouped into batches before they reach the store. A batch
//! carries the stream entry ids it was built from, so that the writer can
//! acknowledge exactly those ids once the batch is durable.
//!
//! The accumulator never holds more than its threshold: the push that
//! reaches the threshold hands the full batch back to the caller.

use crate::domain::records::{BookSnapshotRecord, StoredRecord, TradeRecord};
use crate::domain::stream::EntryId;

// =============================================================================
// Batch
// =============================================================================

/// Ordered records plus their source entry ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    records: Vec<StoredRecord>,
    entry_ids: Vec<EntryId>,
}

impl Batch {
    /// Build a batch from parallel vectors of records and ids.
    #[must_use]
    pub const fn new(records: Vec<StoredRecord>, entry_ids: Vec<EntryId>) -> Self {
        Self { records, entry_ids }
    }

    /// Records in arrival order.
    #[must_use]
    pub fn records(&self) -> &[StoredRecord] {
        &self.records
    }

    /// Source entry ids in arrival order.
    #[must_use]
    pub fn entry_ids(&self) -> &[EntryId] {
        &self.entry_ids
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if the batch holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Smallest and largest source ids, for log context.
    #[must_use]
    pub fn id_range(&self) -> Option<(EntryId, EntryId)> {
        let first = self.entry_ids.iter().min()?;
        let last = self.entry_ids.iter().max()?;
        Some((*first, *last))
    }

    /// Trade records of the batch.
    pub fn trades(&self) -> impl Iterator<Item = &TradeRecord> {
        self.records.iter().filter_map(|r| match r {
            StoredRecord::Trade(t) => Some(t),
            StoredRecord::Book(_) => None,
        })
    }

    /// Book snapshot records of the batch.
    pub fn books(&self) -> impl Iterator<Item = &BookSnapshotRecord> {
        self.records.iter().filter_map(|r| match r {
            StoredRecord::Book(b) => Some(b),
            StoredRecord::Trade(_) => None,
        })
    }

    /// Distinct symbols, in first-seen order.
    #[must_use]
    pub fn symbols(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for record in &self.records {
            let symbol = record.symbol();
            if !out.contains(&symbol) {
                out.push(symbol);
            }
        }
        out
    }

    /// Split into records and ids.
    #[must_use]
    pub fn into_parts(self) -> (Vec<StoredRecord>, Vec<EntryId>) {
        (self.records, self.entry_ids)
    }
}

// =============================================================================
// Accumulator
// =============================================================================

/// Collects records until a size threshold is reached.
#[derive(Debug)]
pub struct BatchAccumulator {
    threshold: usize,
    records: Vec<StoredRecord>,
    entry_ids: Vec<EntryId>,
}

impl BatchAccumulator {
    /// Create an accumulator flushing at `threshold` records (minimum 1).
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            records: Vec::with_capacity(threshold),
            entry_ids: Vec::with_capacity(threshold),
        }
    }

    /// Size threshold.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Add a record. Returns the full batch when the threshold is reached.
    pub fn push(&mut self, entry_id: EntryId, record: StoredRecord) -> Option<Batch> {
        self.records.push(record);
        self.entry_ids.push(entry_id);

        if self.records.len() >= self.threshold {
            self.take()
        } else {
            None
        }
    }

    /// Take everything held as a batch, leaving the accumulator empty.
    pub fn take(&mut self) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }

        let records = std::mem::replace(&mut self.records, Vec::with_capacity(self.threshold));
        let entry_ids = std::mem::replace(&mut self.entry_ids, Vec::with_capacity(self.threshold));
        Some(Batch::new(records, entry_ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn trade(symbol: &str, id: i64) -> StoredRecord {
        StoredRecord::Trade(TradeRecord {
            symbol: symbol.to_string(),
            event_type: "aggTrade".to_string(),
            event_time_ms: id,
            trade_time_ms: id,
            agg_trade_id: id,
            first_trade_id: id,
            last_trade_id: id,
            price: Decimal::ONE,
            quantity: Decimal::ONE,
            is_buyer_maker: false,
        })
    }

    #[test]
    fn push_below_threshold_holds_records() {
        let mut acc = BatchAccumulator::new(3);
        assert!(acc.push(EntryId::new(1, 0), trade("BTCUSDT", 1)).is_none());
        assert!(acc.push(EntryId::new(2, 0), trade("BTCUSDT", 2)).is_none());
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn push_at_threshold_returns_full_batch() {
        let mut acc = BatchAccumulator::new(2);
        assert!(acc.push(EntryId::new(1, 0), trade("BTCUSDT", 1)).is_none());
        let batch = acc.push(EntryId::new(1, 1), trade("ETHUSDT", 2)).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.entry_ids(), &[EntryId::new(1, 0), EntryId::new(1, 1)]);
        assert_eq!(batch.symbols(), vec!["BTCUSDT", "ETHUSDT"]);
        assert!(acc.is_empty());
    }

    #[test]
    fn take_on_empty_returns_none() {
        let mut acc = BatchAccumulator::new(10);
        assert!(acc.take().is_none());
    }

    #[test]
    fn take_drains_partial_batch() {
        let mut acc = BatchAccumulator::new(10);
        acc.push(EntryId::new(5, 0), trade("BTCUSDT", 5));
        acc.push(EntryId::new(3, 0), trade("BTCUSDT", 3));

        let batch = acc.take().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.id_range(), Some((EntryId::new(3, 0), EntryId::new(5, 0))));
        assert!(acc.take().is_none());
    }

    #[test]
    fn zero_threshold_is_clamped() {
        let mut acc = BatchAccumulator::new(0);
        assert_eq!(acc.threshold(), 1);
        assert!(acc.push(EntryId::new(1, 0), trade("BTCUSDT", 1)).is_some());
    }

    #[test]
    fn splits_records_by_table() {
        let batch = Batch::new(
            vec![trade("BTCUSDT", 1), trade("BTCUSDT", 2)],
            vec![EntryId::new(1, 0), EntryId::new(2, 0)],
        );
        assert_eq!(batch.trades().count(), 2);
        assert_eq!(batch.books().count(), 0);
    }
}
