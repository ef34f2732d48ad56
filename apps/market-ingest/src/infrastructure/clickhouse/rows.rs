//! Row types for the ClickHouse tables.
//!
//! Rows are flat: timestamps are epoch milliseconds (`DateTime64(3)` is an
//! `Int64` of ms on the wire) and prices are `Float64`. `insert_time` is
//! filled by the column default and never sent.

use clickhouse::Row;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::domain::market::BookLevel;
use crate::domain::records::{BOOK_DEPTH, BookSnapshotRecord, TradeRecord};

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default().normalize()
}

// =============================================================================
// Trades
// =============================================================================

/// Row of `agg_trades`.
#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct AggTradeRow {
    pub event_type: String,
    pub event_time: i64,
    pub symbol: String,
    pub agg_trade_id: i64,
    pub price: f64,
    pub quantity: f64,
    pub first_trade_id: i64,
    pub last_trade_id: i64,
    pub trade_time: i64,
    pub is_buyer_maker: bool,
}

impl From<&TradeRecord> for AggTradeRow {
    fn from(t: &TradeRecord) -> Self {
        Self {
            event_type: t.event_type.clone(),
            event_time: t.event_time_ms,
            symbol: t.symbol.clone(),
            agg_trade_id: t.agg_trade_id,
            price: to_f64(t.price),
            quantity: to_f64(t.quantity),
            first_trade_id: t.first_trade_id,
            last_trade_id: t.last_trade_id,
            trade_time: t.trade_time_ms,
            is_buyer_maker: t.is_buyer_maker,
        }
    }
}

impl From<AggTradeRow> for TradeRecord {
    fn from(row: AggTradeRow) -> Self {
        Self {
            symbol: row.symbol,
            event_type: row.event_type,
            event_time_ms: row.event_time,
            trade_time_ms: row.trade_time,
            agg_trade_id: row.agg_trade_id,
            first_trade_id: row.first_trade_id,
            last_trade_id: row.last_trade_id,
            price: to_decimal(row.price),
            quantity: to_decimal(row.quantity),
            is_buyer_maker: row.is_buyer_maker,
        }
    }
}

/// Result of the trade statistics query.
#[derive(Debug, Clone, PartialEq, Row, Deserialize)]
pub struct TradeStatsRow {
    pub count: u64,
    pub volume: f64,
    pub avg_price: f64,
    pub low: f64,
    pub high: f64,
}

// =============================================================================
// Book Snapshots
// =============================================================================

/// Row of `book_snapshots`: five levels per side, one column per value.
#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct BookSnapshotRow {
    pub symbol: String,
    pub event_time: i64,
    pub transaction_time: i64,
    pub bid_price1: f64,
    pub bid_price2: f64,
    pub bid_price3: f64,
    pub bid_price4: f64,
    pub bid_price5: f64,
    pub bid_size1: f64,
    pub bid_size2: f64,
    pub bid_size3: f64,
    pub bid_size4: f64,
    pub bid_size5: f64,
    pub ask_price1: f64,
    pub ask_price2: f64,
    pub ask_price3: f64,
    pub ask_price4: f64,
    pub ask_price5: f64,
    pub ask_size1: f64,
    pub ask_size2: f64,
    pub ask_size3: f64,
    pub ask_size4: f64,
    pub ask_size5: f64,
}

impl From<&BookSnapshotRecord> for BookSnapshotRow {
    fn from(b: &BookSnapshotRecord) -> Self {
        let [bp1, bp2, bp3, bp4, bp5] = b.bids.map(|l| to_f64(l.price));
        let [bs1, bs2, bs3, bs4, bs5] = b.bids.map(|l| to_f64(l.size));
        let [ap1, ap2, ap3, ap4, ap5] = b.asks.map(|l| to_f64(l.price));
        let [as1, as2, as3, as4, as5] = b.asks.map(|l| to_f64(l.size));

        Self {
            symbol: b.symbol.clone(),
            event_time: b.event_time_ms,
            transaction_time: b.transaction_time_ms,
            bid_price1: bp1,
            bid_price2: bp2,
            bid_price3: bp3,
            bid_price4: bp4,
            bid_price5: bp5,
            bid_size1: bs1,
            bid_size2: bs2,
            bid_size3: bs3,
            bid_size4: bs4,
            bid_size5: bs5,
            ask_price1: ap1,
            ask_price2: ap2,
            ask_price3: ap3,
            ask_price4: ap4,
            ask_price5: ap5,
            ask_size1: as1,
            ask_size2: as2,
            ask_size3: as3,
            ask_size4: as4,
            ask_size5: as5,
        }
    }
}

impl From<BookSnapshotRow> for BookSnapshotRecord {
    fn from(r: BookSnapshotRow) -> Self {
        let side = |prices: [f64; BOOK_DEPTH], sizes: [f64; BOOK_DEPTH]| {
            let mut levels = [BookLevel::default(); BOOK_DEPTH];
            for (level, (price, size)) in levels.iter_mut().zip(prices.into_iter().zip(sizes)) {
                *level = BookLevel::new(to_decimal(price), to_decimal(size));
            }
            levels
        };

        Self {
            symbol: r.symbol,
            event_time_ms: r.event_time,
            transaction_time_ms: r.transaction_time,
            bids: side(
                [r.bid_price1, r.bid_price2, r.bid_price3, r.bid_price4, r.bid_price5],
                [r.bid_size1, r.bid_size2, r.bid_size3, r.bid_size4, r.bid_size5],
            ),
            asks: side(
                [r.ask_price1, r.ask_price2, r.ask_price3, r.ask_price4, r.ask_price5],
                [r.ask_size1, r.ask_size2, r.ask_size3, r.ask_size4, r.ask_size5],
            ),
        }
    }
}
