//! Market Events
//!
//! Codec-agnostic representation of the feed messages that enter the
//! pipeline. The feed adapter converts exchange wire messages into these
//! types, and their JSON form is the payload of every stream entry.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggregate trade: one or more fills at the same price from one taker order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggTrade {
    /// Instrument symbol, e.g. `BTCUSDT`.
    pub symbol: String,
    /// Exchange event time (epoch ms).
    pub event_time_ms: i64,
    /// Aggregate trade id.
    pub agg_trade_id: i64,
    /// Fill price.
    pub price: Decimal,
    /// Fill quantity.
    pub quantity: Decimal,
    /// First constituent trade id.
    pub first_trade_id: i64,
    /// Last constituent trade id.
    pub last_trade_id: i64,
    /// Trade time (epoch ms).
    pub trade_time_ms: i64,
    /// Whether the buyer was the maker.
    pub buyer_is_maker: bool,
}

/// Individual trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Instrument symbol.
    pub symbol: String,
    /// Exchange event time (epoch ms).
    pub event_time_ms: i64,
    /// Trade id.
    pub trade_id: i64,
    /// Fill price.
    pub price: Decimal,
    /// Fill quantity.
    pub quantity: Decimal,
    /// Trade time (epoch ms).
    pub trade_time_ms: i64,
    /// Whether the buyer was the maker.
    pub buyer_is_maker: bool,
}

/// One price level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BookLevel {
    /// Level price.
    pub price: Decimal,
    /// Resting size at this price.
    pub size: Decimal,
}

impl BookLevel {
    /// Create a level.
    #[must_use]
    pub const fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Partial order book update, best levels first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthUpdate {
    /// Instrument symbol.
    pub symbol: String,
    /// Exchange event time (epoch ms).
    pub event_time_ms: i64,
    /// Matching-engine transaction time (epoch ms), 0 if not reported.
    pub transaction_time_ms: i64,
    /// Bid levels, best first.
    pub bids: Vec<BookLevel>,
    /// Ask levels, best first.
    pub asks: Vec<BookLevel>,
}

/// A data message accepted from the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketEvent {
    /// Aggregate trade.
    AggTrade(AggTrade),
    /// Individual trade.
    Trade(Trade),
    /// Partial book depth.
    Depth(DepthUpdate),
}

impl MarketEvent {
    /// Symbol the event refers to.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::AggTrade(t) => &t.symbol,
            Self::Trade(t) => &t.symbol,
            Self::Depth(d) => &d.symbol,
        }
    }

    /// Exchange event time (epoch ms).
    #[must_use]
    pub const fn event_time_ms(&self) -> i64 {
        match self {
            Self::AggTrade(t) => t.event_time_ms,
            Self::Trade(t) => t.event_time_ms,
            Self::Depth(d) => d.event_time_ms,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AggTrade(_) => "agg_trade",
            Self::Trade(_) => "trade",
            Self::Depth(_) => "depth",
        }
    }

    /// Serialize to the stream payload format.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a stream payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid event.
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn sample_agg_trade() -> AggTrade {
        AggTrade {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: 1_700_000_000_123,
            agg_trade_id: 42,
            price: dec("43250.10"),
            quantity: dec("0.015"),
            first_trade_id: 100,
            last_trade_id: 102,
            trade_time_ms: 1_700_000_000_120,
            buyer_is_maker: true,
        }
    }

    #[test]
    fn payload_is_tagged_with_kind() {
        let event = MarketEvent::AggTrade(sample_agg_trade());
        let payload = event.to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["kind"], "agg_trade");
        assert_eq!(value["symbol"], "BTCUSDT");
        assert_eq!(value["price"], "43250.10");
    }

    #[test]
    fn payload_parses_back() {
        let event = MarketEvent::AggTrade(sample_agg_trade());
        let parsed = MarketEvent::from_payload(&event.to_payload().unwrap()).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.symbol(), "BTCUSDT");
        assert_eq!(parsed.kind(), "agg_trade");
        assert_eq!(parsed.event_time_ms(), 1_700_000_000_123);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = MarketEvent::from_payload(r#"{"kind":"kline","symbol":"X"}"#);
        assert!(err.is_err());
    }
}
