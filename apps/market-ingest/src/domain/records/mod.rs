//! Store Records
//!
//! Rows persisted to the columnar store, and the error records that take
//! their place when a payload cannot be transformed or written.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market::BookLevel;
use crate::domain::stream::EntryId;

/// Levels per side kept in a book snapshot.
pub const BOOK_DEPTH: usize = 5;

// =============================================================================
// Trade Records
// =============================================================================

/// Persisted trade. Individual trades are stored with `agg_trade_id`,
/// `first_trade_id`, and `last_trade_id` all equal to the trade id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Instrument symbol.
    pub symbol: String,
    /// Feed event type (`aggTrade` or `trade`).
    pub event_type: String,
    /// Event time (epoch ms).
    pub event_time_ms: i64,
    /// Trade time (epoch ms).
    pub trade_time_ms: i64,
    /// Aggregate trade id.
    pub agg_trade_id: i64,
    /// First constituent trade id.
    pub first_trade_id: i64,
    /// Last constituent trade id.
    pub last_trade_id: i64,
    /// Fill price.
    pub price: Decimal,
    /// Fill quantity.
    pub quantity: Decimal,
    /// Whether the buyer was the maker.
    pub is_buyer_maker: bool,
}

// =============================================================================
// Book Snapshot Records
// =============================================================================

/// Persisted top-of-book snapshot with exactly [`BOOK_DEPTH`] levels per side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshotRecord {
    /// Instrument symbol.
    pub symbol: String,
    /// Event time (epoch ms).
    pub event_time_ms: i64,
    /// Transaction time (epoch ms).
    pub transaction_time_ms: i64,
    /// Best bids, best first.
    pub bids: [BookLevel; BOOK_DEPTH],
    /// Best asks, best first.
    pub asks: [BookLevel; BOOK_DEPTH],
}

// =============================================================================
// Stored Record
// =============================================================================

/// A record ready for the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum StoredRecord {
    /// Row of the trades table.
    Trade(TradeRecord),
    /// Row of the book snapshot table.
    Book(BookSnapshotRecord),
}

impl StoredRecord {
    /// Symbol of the record.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Trade(t) => &t.symbol,
            Self::Book(b) => &b.symbol,
        }
    }

    /// Event time (epoch ms).
    #[must_use]
    pub const fn event_time_ms(&self) -> i64 {
        match self {
            Self::Trade(t) => t.event_time_ms,
            Self::Book(b) => b.event_time_ms,
        }
    }
}

// =============================================================================
// Error Records
// =============================================================================

/// Why a payload was diverted to the error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The payload could not be turned into a store record.
    Transform,
    /// The feed message could not be appended to the stream buffer.
    Produce,
    /// The store rejected the batch on every attempt.
    WriteExhausted,
}

impl ErrorKind {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transform => "transform",
            Self::Produce => "produce",
            Self::WriteExhausted => "write_exhausted",
        }
    }
}

/// A payload that failed somewhere in the pipeline, with replay context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Failure category.
    pub kind: ErrorKind,
    /// Source stream entry, if the payload had reached the buffer.
    pub entry_id: Option<EntryId>,
    /// Symbol, if known.
    pub symbol: Option<String>,
    /// Original payload or record JSON.
    pub payload: String,
    /// Human-readable reason.
    pub reason: String,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// When the failure was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    /// Create an error record stamped with the current time.
    #[must_use]
    pub fn new(kind: ErrorKind, payload: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            entry_id: None,
            symbol: None,
            payload: payload.into(),
            reason: reason.into(),
            attempts: 1,
            occurred_at: Utc::now(),
        }
    }

    /// Attach the source entry id.
    #[must_use]
    pub const fn with_entry_id(mut self, id: EntryId) -> Self {
        self.entry_id = Some(id);
        self
    }

    /// Attach the symbol.
    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    /// Set the attempt count.
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_record_builder() {
        let record = ErrorRecord::new(ErrorKind::WriteExhausted, "{}", "store down")
            .with_entry_id(EntryId::new(10, 2))
            .with_symbol("ETHUSDT")
            .with_attempts(4);

        assert_eq!(record.kind, ErrorKind::WriteExhausted);
        assert_eq!(record.entry_id, Some(EntryId::new(10, 2)));
        assert_eq!(record.symbol.as_deref(), Some("ETHUSDT"));
        assert_eq!(record.attempts, 4);
    }

    #[test]
    fn error_record_json_carries_entry_id_text() {
        let record =
            ErrorRecord::new(ErrorKind::Transform, "oops", "bad json").with_entry_id(EntryId::new(1, 0));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "transform");
        assert_eq!(json["entry_id"], "1-0");
    }

    #[test]
    fn error_kind_labels() {
        assert_eq!(ErrorKind::Transform.as_str(), "transform");
        assert_eq!(ErrorKind::Produce.as_str(), "produce");
        assert_eq!(ErrorKind::WriteExhausted.as_str(), "write_exhausted");
    }
}
