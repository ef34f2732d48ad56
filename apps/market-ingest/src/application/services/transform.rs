//! Payload Transform
//!
//! Turns a stream entry payload into a store record, validating it on the
//! way. A failure here is local to one entry: the consumer routes it to the
//! error channel and the rest of the batch proceeds.

use rust_decimal::Decimal;

use crate::domain::market::{AggTrade, BookLevel, DepthUpdate, MarketEvent, Trade};
use crate::domain::records::{BOOK_DEPTH, BookSnapshotRecord, StoredRecord, TradeRecord};

/// Reasons a payload cannot become a store record.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The payload is not a market event.
    #[error("payload is not a market event: {0}")]
    Decode(#[from] serde_json::Error),

    /// The symbol is empty.
    #[error("event has no symbol")]
    MissingSymbol,

    /// Price is zero or negative.
    #[error("{symbol}: non-positive price {price}")]
    InvalidPrice {
        /// Symbol of the event.
        symbol: String,
        /// Offending price.
        price: Decimal,
    },

    /// Quantity is negative.
    #[error("{symbol}: negative quantity {quantity}")]
    InvalidQuantity {
        /// Symbol of the event.
        symbol: String,
        /// Offending quantity.
        quantity: Decimal,
    },

    /// Event time is not a positive epoch timestamp.
    #[error("{symbol}: invalid event time {event_time_ms}")]
    InvalidTimestamp {
        /// Symbol of the event.
        symbol: String,
        /// Offending timestamp.
        event_time_ms: i64,
    },

    /// Fewer book levels than a snapshot needs.
    #[error("{symbol}: {side} side has {levels} levels, need {depth}", depth = BOOK_DEPTH)]
    InsufficientDepth {
        /// Symbol of the event.
        symbol: String,
        /// `bid` or `ask`.
        side: &'static str,
        /// Levels present.
        levels: usize,
    },
}

/// Transform a stream payload into a store record.
///
/// # Errors
///
/// Returns `TransformError` if the payload does not decode or fails
/// validation.
pub fn transform_payload(payload: &str) -> Result<StoredRecord, TransformError> {
    let event = MarketEvent::from_payload(payload)?;
    transform_event(event)
}

/// Transform a decoded market event into a store record.
///
/// # Errors
///
/// Returns `TransformError` if the event fails validation.
pub fn transform_event(event: MarketEvent) -> Result<StoredRecord, TransformError> {
    match event {
        MarketEvent::AggTrade(t) => agg_trade_record(t).map(StoredRecord::Trade),
        MarketEvent::Trade(t) => trade_record(t).map(StoredRecord::Trade),
        MarketEvent::Depth(d) => book_record(d).map(StoredRecord::Book),
    }
}

/// Best-effort symbol extraction for error context.
#[must_use]
pub fn payload_symbol(payload: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(payload)
        .ok()?
        .get("symbol")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn agg_trade_record(t: AggTrade) -> Result<TradeRecord, TransformError> {
    validate_common(&t.symbol, t.event_time_ms)?;
    validate_fill(&t.symbol, t.price, t.quantity)?;

    Ok(TradeRecord {
        symbol: t.symbol,
        event_type: "aggTrade".to_string(),
        event_time_ms: t.event_time_ms,
        trade_time_ms: t.trade_time_ms,
        agg_trade_id: t.agg_trade_id,
        first_trade_id: t.first_trade_id,
        last_trade_id: t.last_trade_id,
        price: t.price,
        quantity: t.quantity,
        is_buyer_maker: t.buyer_is_maker,
    })
}

fn trade_record(t: Trade) -> Result<TradeRecord, TransformError> {
    validate_common(&t.symbol, t.event_time_ms)?;
    validate_fill(&t.symbol, t.price, t.quantity)?;

    Ok(TradeRecord {
        symbol: t.symbol,
        event_type: "trade".to_string(),
        event_time_ms: t.event_time_ms,
        trade_time_ms: t.trade_time_ms,
        agg_trade_id: t.trade_id,
        first_trade_id: t.trade_id,
        last_trade_id: t.trade_id,
        price: t.price,
        quantity: t.quantity,
        is_buyer_maker: t.buyer_is_maker,
    })
}

fn book_record(d: DepthUpdate) -> Result<BookSnapshotRecord, TransformError> {
    validate_common(&d.symbol, d.event_time_ms)?;

    let bids = top_levels(&d.symbol, "bid", &d.bids)?;
    let asks = top_levels(&d.symbol, "ask", &d.asks)?;

    Ok(BookSnapshotRecord {
        symbol: d.symbol,
        event_time_ms: d.event_time_ms,
        transaction_time_ms: d.transaction_time_ms,
        bids,
        asks,
    })
}

fn top_levels(
    symbol: &str,
    side: &'static str,
    levels: &[BookLevel],
) -> Result<[BookLevel; BOOK_DEPTH], TransformError> {
    if levels.len() < BOOK_DEPTH {
        return Err(TransformError::InsufficientDepth {
            symbol: symbol.to_string(),
            side,
            levels: levels.len(),
        });
    }

    let mut out = [BookLevel::default(); BOOK_DEPTH];
    out.copy_from_slice(&levels[..BOOK_DEPTH]);
    Ok(out)
}

fn validate_common(symbol: &str, event_time_ms: i64) -> Result<(), TransformError> {
    if symbol.trim().is_empty() {
        return Err(TransformError::MissingSymbol);
    }
    if event_time_ms <= 0 {
        return Err(TransformError::InvalidTimestamp {
            symbol: symbol.to_string(),
            event_time_ms,
        });
    }
    Ok(())
}

fn validate_fill(symbol: &str, price: Decimal, quantity: Decimal) -> Result<(), TransformError> {
    if price <= Decimal::ZERO {
        return Err(TransformError::InvalidPrice {
            symbol: symbol.to_string(),
            price,
        });
    }
    if quantity < Decimal::ZERO {
        return Err(TransformError::InvalidQuantity {
            symbol: symbol.to_string(),
            quantity,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn agg(symbol: &str, price: &str, quantity: &str) -> MarketEvent {
        MarketEvent::AggTrade(AggTrade {
            symbol: symbol.to_string(),
            event_time_ms: 1_700_000_000_000,
            agg_trade_id: 7,
            price: dec(price),
            quantity: dec(quantity),
            first_trade_id: 10,
            last_trade_id: 12,
            trade_time_ms: 1_700_000_000_000,
            buyer_is_maker: false,
        })
    }

    fn depth(bid_levels: usize, ask_levels: usize) -> MarketEvent {
        let level = |i: usize| BookLevel::new(Decimal::from(100 + i), Decimal::ONE);
        MarketEvent::Depth(DepthUpdate {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: 1_700_000_000_000,
            transaction_time_ms: 1_700_000_000_001,
            bids: (0..bid_levels).map(level).collect(),
            asks: (0..ask_levels).map(level).collect(),
        })
    }

    #[test]
    fn agg_trade_becomes_trade_record() {
        let record = transform_event(agg("BTCUSDT", "43000.5", "0.25")).unwrap();
        let StoredRecord::Trade(t) = record else {
            panic!("expected trade record");
        };
        assert_eq!(t.event_type, "aggTrade");
        assert_eq!(t.agg_trade_id, 7);
        assert_eq!(t.first_trade_id, 10);
        assert_eq!(t.last_trade_id, 12);
        assert_eq!(t.price, dec("43000.5"));
    }

    #[test]
    fn single_trade_uses_trade_id_for_all_ids() {
        let event = MarketEvent::Trade(Trade {
            symbol: "ETHUSDT".to_string(),
            event_time_ms: 5,
            trade_id: 99,
            price: dec("2000"),
            quantity: dec("1"),
            trade_time_ms: 5,
            buyer_is_maker: true,
        });
        let StoredRecord::Trade(t) = transform_event(event).unwrap() else {
            panic!("expected trade record");
        };
        assert_eq!(t.event_type, "trade");
        assert_eq!((t.agg_trade_id, t.first_trade_id, t.last_trade_id), (99, 99, 99));
    }

    #[test]
    fn depth_keeps_top_five_levels() {
        let StoredRecord::Book(b) = transform_event(depth(10, 7)).unwrap() else {
            panic!("expected book record");
        };
        assert_eq!(b.bids[0].price, Decimal::from(100));
        assert_eq!(b.bids[4].price, Decimal::from(104));
        assert_eq!(b.asks[4].price, Decimal::from(104));
    }

    #[test_case(4, 5, "bid" ; "short bids")]
    #[test_case(5, 0, "ask" ; "empty asks")]
    fn shallow_depth_is_rejected(bids: usize, asks: usize, expected_side: &str) {
        match transform_event(depth(bids, asks)) {
            Err(TransformError::InsufficientDepth { side, .. }) => assert_eq!(side, expected_side),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test_case("", "1", "1" ; "empty symbol")]
    #[test_case("BTCUSDT", "0", "1" ; "zero price")]
    #[test_case("BTCUSDT", "-5", "1" ; "negative price")]
    #[test_case("BTCUSDT", "10", "-1" ; "negative quantity")]
    fn invalid_fills_are_rejected(symbol: &str, price: &str, quantity: &str) {
        assert!(transform_event(agg(symbol, price, quantity)).is_err());
    }

    #[test]
    fn zero_quantity_is_accepted() {
        assert!(transform_event(agg("BTCUSDT", "1", "0")).is_ok());
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        assert!(matches!(
            transform_payload("not json"),
            Err(TransformError::Decode(_))
        ));
    }

    #[test]
    fn payload_symbol_extraction() {
        assert_eq!(
            payload_symbol(r#"{"kind":"trade","symbol":"SOLUSDT"}"#).as_deref(),
            Some("SOLUSDT")
        );
        assert_eq!(payload_symbol("garbage"), None);
        assert_eq!(payload_symbol(r#"{"symbol":""}"#), None);
    }
}
