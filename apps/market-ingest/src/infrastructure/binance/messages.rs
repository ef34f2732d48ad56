//! Binance Futures WebSocket Message Types
//!
//! Wire representations of the market streams and control frames.
//! Field names follow the exchange's single-letter keys; conversion into
//! [`MarketEvent`] happens here so nothing past the adapter sees them.
//!
//! # Event Types (`e`)
//!
//! - `aggTrade` - Aggregate trade
//! - `trade` - Individual trade
//! - `depthUpdate` - Partial book depth
//!
//! Subscription replies (`{"result": null, "id": 1}`) and error replies
//! (`{"error": {...}, "id": 1}`) carry no `e` field.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market::{AggTrade, BookLevel, DepthUpdate, MarketEvent, Trade};

// =============================================================================
// Market Streams
// =============================================================================

/// Aggregate trade (`<symbol>@aggTrade`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AggTradeMessage {
    /// Event time (ms).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Aggregate trade id.
    #[serde(rename = "a")]
    pub agg_trade_id: i64,
    /// Price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q")]
    pub quantity: Decimal,
    /// First trade id.
    #[serde(rename = "f")]
    pub first_trade_id: i64,
    /// Last trade id.
    #[serde(rename = "l")]
    pub last_trade_id: i64,
    /// Trade time (ms).
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Buyer is the market maker.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

/// Individual trade (`<symbol>@trade`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TradeMessage {
    /// Event time (ms).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Trade time (ms).
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Trade id.
    #[serde(rename = "t")]
    pub trade_id: i64,
    /// Price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q")]
    pub quantity: Decimal,
    /// Buyer is the market maker.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

/// Depth update (`<symbol>@depth<levels>` or `<symbol>@depth`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DepthMessage {
    /// Event time (ms).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Transaction time (ms). Spot streams omit it.
    #[serde(rename = "T", default)]
    pub transaction_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Bids as `[price, quantity]`, best first.
    #[serde(rename = "b")]
    pub bids: Vec<[Decimal; 2]>,
    /// Asks as `[price, quantity]`, best first.
    #[serde(rename = "a")]
    pub asks: Vec<[Decimal; 2]>,
}

// =============================================================================
// Control Frames
// =============================================================================

/// Reply to a subscription request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlMessage {
    /// `null` on success, or the requested data for list requests.
    #[serde(default)]
    pub result: serde_json::Value,
    /// Request id this replies to.
    pub id: Option<u64>,
}

/// Error reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorReply {
    /// Error details.
    pub error: ErrorDetail,
    /// Request id this replies to.
    pub id: Option<u64>,
}

/// Error code and message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorDetail {
    /// Exchange error code.
    pub code: i64,
    /// Human-readable message.
    pub msg: String,
}

/// `SUBSCRIBE` / `UNSUBSCRIBE` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRequest {
    /// `SUBSCRIBE` or `UNSUBSCRIBE`.
    pub method: &'static str,
    /// Stream names.
    pub params: Vec<String>,
    /// Request id echoed in the reply.
    pub id: u64,
}

impl SubscriptionRequest {
    /// Create a subscribe request.
    #[must_use]
    pub const fn subscribe(params: Vec<String>, id: u64) -> Self {
        Self {
            method: "SUBSCRIBE",
            params,
            id,
        }
    }

    /// Create an unsubscribe request.
    #[must_use]
    pub const fn unsubscribe(params: Vec<String>, id: u64) -> Self {
        Self {
            method: "UNSUBSCRIBE",
            params,
            id,
        }
    }
}

// =============================================================================
// Decoded Frame
// =============================================================================

/// One decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Aggregate trade.
    AggTrade(AggTradeMessage),
    /// Individual trade.
    Trade(TradeMessage),
    /// Depth update.
    Depth(DepthMessage),
    /// Subscription reply.
    Control(ControlMessage),
    /// Error reply.
    Error(ErrorReply),
    /// Known exchange event type that is published but not stored, such
    /// as klines and mark prices.
    Ignored {
        /// Value of the `e` field.
        event_type: String,
        /// Symbol, when the frame carries one.
        symbol: Option<String>,
    },
    /// Well-formed event of a type this pipeline does not recognize.
    Unsupported(String),
}

/// Futures event types the exchange publishes that are recognized but not
/// stored.
pub const IGNORED_EVENT_TYPES: &[&str] = &[
    "kline",
    "continuous_kline",
    "markPriceUpdate",
    "bookTicker",
    "24hrTicker",
    "24hrMiniTicker",
    "forceOrder",
    "compositeIndex",
];

impl FeedMessage {
    /// Convert a data frame into a market event. Control, error and
    /// unsupported frames yield `None`.
    #[must_use]
    pub fn into_market_event(self) -> Option<MarketEvent> {
        match self {
            Self::AggTrade(m) => Some(MarketEvent::AggTrade(m.into())),
            Self::Trade(m) => Some(MarketEvent::Trade(m.into())),
            Self::Depth(m) => Some(MarketEvent::Depth(m.into())),
            Self::Control(_) | Self::Error(_) | Self::Ignored { .. } | Self::Unsupported(_) => {
                None
            }
        }
    }
}

impl From<AggTradeMessage> for AggTrade {
    fn from(m: AggTradeMessage) -> Self {
        Self {
            symbol: m.symbol,
            event_time_ms: m.event_time,
            agg_trade_id: m.agg_trade_id,
            price: m.price,
            quantity: m.quantity,
            first_trade_id: m.first_trade_id,
            last_trade_id: m.last_trade_id,
            trade_time_ms: m.trade_time,
            buyer_is_maker: m.buyer_is_maker,
        }
    }
}

impl From<TradeMessage> for Trade {
    fn from(m: TradeMessage) -> Self {
        Self {
            symbol: m.symbol,
            event_time_ms: m.event_time,
            trade_id: m.trade_id,
            price: m.price,
            quantity: m.quantity,
            trade_time_ms: m.trade_time,
            buyer_is_maker: m.buyer_is_maker,
        }
    }
}

impl From<DepthMessage> for DepthUpdate {
    fn from(m: DepthMessage) -> Self {
        let level = |[price, size]: [Decimal; 2]| BookLevel::new(price, size);
        Self {
            symbol: m.symbol,
            event_time_ms: m.event_time,
            transaction_time_ms: m.transaction_time,
            bids: m.bids.into_iter().map(level).collect(),
            asks: m.asks.into_iter().map(level).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agg_trade_wire_format() {
        let json = r#"{"e":"aggTrade","E":1700000000123,"a":5933014,"s":"BTCUSDT",
            "p":"43012.10","q":"0.015","f":100,"l":105,"T":1700000000120,"m":true}"#;
        let msg: AggTradeMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.symbol, "BTCUSDT");
        assert_eq!(msg.event_time, 1_700_000_000_123);
        assert_eq!(msg.price, "43012.10".parse::<Decimal>().unwrap());
        assert!(msg.buyer_is_maker);

        let MarketEvent::AggTrade(event) = FeedMessage::AggTrade(msg).into_market_event().unwrap()
        else {
            panic!("expected agg trade");
        };
        assert_eq!(event.first_trade_id, 100);
        assert_eq!(event.trade_time_ms, 1_700_000_000_120);
    }

    #[test]
    fn depth_levels_become_book_levels() {
        let json = r#"{"e":"depthUpdate","E":1,"T":2,"s":"ETHUSDT","U":1,"u":2,"pu":0,
            "b":[["2000.1","3"],["2000.0","1.5"]],"a":[["2000.2","4"]]}"#;
        let msg: DepthMessage = serde_json::from_str(json).unwrap();
        let update = DepthUpdate::from(msg);
        assert_eq!(update.transaction_time_ms, 2);
        assert_eq!(update.bids.len(), 2);
        assert_eq!(update.asks[0].size, Decimal::from(4));
    }

    #[test]
    fn depth_without_transaction_time_defaults_to_zero() {
        let json = r#"{"e":"depthUpdate","E":1,"s":"ETHUSDT","b":[],"a":[]}"#;
        let msg: DepthMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.transaction_time, 0);
    }

    #[test]
    fn subscription_request_serialization() {
        let request = SubscriptionRequest::subscribe(vec!["btcusdt@aggTrade".to_string()], 7);
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"method":"SUBSCRIBE","params":["btcusdt@aggTrade"],"id":7}"#);
    }

    #[test]
    fn control_frames_are_not_events() {
        let control = FeedMessage::Control(ControlMessage {
            result: serde_json::Value::Null,
            id: Some(1),
        });
        assert!(control.into_market_event().is_none());
        assert!(
            FeedMessage::Unsupported("fundingNotice".into())
                .into_market_event()
                .is_none()
        );
        assert!(
            FeedMessage::Ignored {
                event_type: "markPriceUpdate".into(),
                symbol: Some("BTCUSDT".into()),
            }
            .into_market_event()
            .is_none()
        );
    }
}
