//! Table definitions.
//!
//! Both tables are `MergeTree`, partitioned by event day and ordered by
//! `(event_time, symbol)`. All statements are idempotent.

/// Aggregate and individual trades.
pub const AGG_TRADES_TABLE: &str = "agg_trades";

/// Top-of-book snapshots.
pub const BOOK_SNAPSHOTS_TABLE: &str = "book_snapshots";

/// `CREATE DATABASE` for `database`.
#[must_use]
pub fn create_database(database: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS `{}`", database.replace('`', ""))
}

/// DDL for [`AGG_TRADES_TABLE`].
pub const CREATE_AGG_TRADES: &str = r"
CREATE TABLE IF NOT EXISTS agg_trades
(
    event_type      LowCardinality(String),
    event_time      DateTime64(3),
    symbol          LowCardinality(String),
    agg_trade_id    Int64,
    price           Float64,
    quantity        Float64,
    first_trade_id  Int64,
    last_trade_id   Int64,
    trade_time      DateTime64(3),
    is_buyer_maker  Bool,
    insert_time     DateTime64(3) DEFAULT now64(3)
)
ENGINE = MergeTree
PARTITION BY toYYYYMMDD(event_time)
ORDER BY (event_time, symbol)
";

/// DDL for [`BOOK_SNAPSHOTS_TABLE`].
pub const CREATE_BOOK_SNAPSHOTS: &str = r"
CREATE TABLE IF NOT EXISTS book_snapshots
(
    symbol            LowCardinality(String),
    event_time        DateTime64(3),
    transaction_time  DateTime64(3),
    bid_price1 Float64, bid_price2 Float64, bid_price3 Float64, bid_price4 Float64, bid_price5 Float64,
    bid_size1  Float64, bid_size2  Float64, bid_size3  Float64, bid_size4  Float64, bid_size5  Float64,
    ask_price1 Float64, ask_price2 Float64, ask_price3 Float64, ask_price4 Float64, ask_price5 Float64,
    ask_size1  Float64, ask_size2  Float64, ask_size3  Float64, ask_size4  Float64, ask_size5  Float64,
    insert_time       DateTime64(3) DEFAULT now64(3)
)
ENGINE = MergeTree
PARTITION BY toYYYYMMDD(event_time)
ORDER BY (event_time, symbol)
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_name_is_quoted() {
        assert_eq!(
            create_database("crypto_data"),
            "CREATE DATABASE IF NOT EXISTS `crypto_data`"
        );
        assert_eq!(
            create_database("a`b"),
            "CREATE DATABASE IF NOT EXISTS `ab`"
        );
    }

    #[test]
    fn tables_are_partitioned_by_day() {
        for ddl in [CREATE_AGG_TRADES, CREATE_BOOK_SNAPSHOTS] {
            assert!(ddl.contains("PARTITION BY toYYYYMMDD(event_time)"));
            assert!(ddl.contains("ORDER BY (event_time, symbol)"));
            assert!(ddl.contains("DEFAULT now64(3)"));
        }
        assert!(CREATE_AGG_TRADES.contains(AGG_TRADES_TABLE));
        assert!(CREATE_BOOK_SNAPSHOTS.contains(BOOK_SNAPSHOTS_TABLE));
    }
}
