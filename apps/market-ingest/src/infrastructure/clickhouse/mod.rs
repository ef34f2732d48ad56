//! ClickHouse Record Store
//!
//! `RecordStore` and `RecordReader` over the ClickHouse HTTP interface.
//! A batch is written as at most two bulk inserts, one per table; the
//! two inserts are independent, so a failure after the first one leaves
//! its rows in place and the retry writes them again.

mod rows;
pub mod schema;

use async_trait::async_trait;
use clickhouse::Client;
use clickhouse::query::Query;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;

use self::rows::{AggTradeRow, BookSnapshotRow, TradeStatsRow};
use self::schema::{
    AGG_TRADES_TABLE, BOOK_SNAPSHOTS_TABLE, CREATE_AGG_TRADES, CREATE_BOOK_SNAPSHOTS,
};
use crate::StoreSettings;
use crate::application::ports::{RecordQuery, RecordReader, RecordStore, StoreError, TradeStats};
use crate::domain::records::{BookSnapshotRecord, StoredRecord, TradeRecord};

/// ClickHouse implementation of `RecordStore` and `RecordReader`.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
    admin: Client,
    database: String,
}

impl ClickHouseStore {
    /// Build clients for the configured endpoint. No connection is made
    /// until the first query.
    #[must_use]
    pub fn new(settings: &StoreSettings) -> Self {
        let mut admin = Client::default().with_url(&settings.url);
        if let Some(user) = &settings.user {
            admin = admin.with_user(user);
        }
        if let Some(password) = &settings.password {
            admin = admin.with_password(password);
        }
        let client = admin.clone().with_database(&settings.database);

        Self {
            client,
            admin,
            database: settings.database.clone(),
        }
    }

    /// Database holding the tables.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    async fn insert_trades(&self, rows: &[AggTradeRow]) -> Result<(), clickhouse::error::Error> {
        let mut insert = self.client.insert::<AggTradeRow>(AGG_TRADES_TABLE)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await
    }

    async fn insert_books(
        &self,
        rows: &[BookSnapshotRow],
    ) -> Result<(), clickhouse::error::Error> {
        let mut insert = self.client.insert::<BookSnapshotRow>(BOOK_SNAPSHOTS_TABLE)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await
    }
}

#[async_trait]
impl RecordStore for ClickHouseStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.admin
            .query(&schema::create_database(&self.database))
            .execute()
            .await
            .map_err(schema_error)?;

        for ddl in [CREATE_AGG_TRADES, CREATE_BOOK_SNAPSHOTS] {
            self.client
                .query(ddl)
                .execute()
                .await
                .map_err(schema_error)?;
        }

        tracing::info!(database = self.database(), "ClickHouse schema ready");
        Ok(())
    }

    async fn insert(&self, records: &[StoredRecord]) -> Result<(), StoreError> {
        let mut trades = Vec::new();
        let mut books = Vec::new();
        for record in records {
            match record {
                StoredRecord::Trade(t) => trades.push(AggTradeRow::from(t)),
                StoredRecord::Book(b) => books.push(BookSnapshotRow::from(b)),
            }
        }

        if !trades.is_empty() {
            self.insert_trades(&trades).await.map_err(insert_error)?;
        }
        if !books.is_empty() {
            self.insert_books(&books).await.map_err(insert_error)?;
        }

        tracing::debug!(trades = trades.len(), books = books.len(), "Rows inserted");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map(|_| ())
            .map_err(query_error)
    }
}

#[async_trait]
impl RecordReader for ClickHouseStore {
    async fn query_trades(&self, query: &RecordQuery) -> Result<Vec<TradeRecord>, StoreError> {
        let sql = format!(
            "SELECT ?fields FROM {AGG_TRADES_TABLE}{} ORDER BY event_time DESC LIMIT {}",
            where_clause(query),
            query.limit
        );
        let rows = bind_filter(self.client.query(&sql), query)
            .fetch_all::<AggTradeRow>()
            .await
            .map_err(query_error)?;
        Ok(rows.into_iter().map(TradeRecord::from).collect())
    }

    async fn query_books(
        &self,
        query: &RecordQuery,
    ) -> Result<Vec<BookSnapshotRecord>, StoreError> {
        let sql = format!(
            "SELECT ?fields FROM {BOOK_SNAPSHOTS_TABLE}{} ORDER BY event_time DESC LIMIT {}",
            where_clause(query),
            query.limit
        );
        let rows = bind_filter(self.client.query(&sql), query)
            .fetch_all::<BookSnapshotRow>()
            .await
            .map_err(query_error)?;
        Ok(rows.into_iter().map(BookSnapshotRecord::from).collect())
    }

    async fn trade_stats(&self, query: &RecordQuery) -> Result<Option<TradeStats>, StoreError> {
        let sql = format!(
            "SELECT count() AS count, sum(quantity) AS volume, avg(price) AS avg_price, \
             min(price) AS low, max(price) AS high FROM {AGG_TRADES_TABLE}{}",
            where_clause(query)
        );
        let row = bind_filter(self.client.query(&sql), query)
            .fetch_one::<TradeStatsRow>()
            .await
            .map_err(query_error)?;

        if row.count == 0 {
            return Ok(None);
        }
        Ok(Some(TradeStats {
            count: row.count,
            volume: stat_decimal(row.volume, "volume")?,
            avg_price: stat_decimal(row.avg_price, "avg_price")?,
            low: stat_decimal(row.low, "low")?,
            high: stat_decimal(row.high, "high")?,
        }))
    }

    async fn count_trades(&self, query: &RecordQuery) -> Result<u64, StoreError> {
        let sql = format!("SELECT count() FROM {AGG_TRADES_TABLE}{}", where_clause(query));
        bind_filter(self.client.query(&sql), query)
            .fetch_one::<u64>()
            .await
            .map_err(query_error)
    }
}

/// Aggregates come back as `Float64`; NaN and infinities have no decimal form.
fn stat_decimal(value: f64, column: &str) -> Result<Decimal, StoreError> {
    Decimal::from_f64(value)
        .map(|d| d.normalize())
        .ok_or_else(|| StoreError::Query(format!("{column} is not a finite decimal: {value}")))
}

// =============================================================================
// Query Building
// =============================================================================

/// `WHERE` clause with one `?` per set filter, in `bind_filter` order.
fn where_clause(query: &RecordQuery) -> String {
    let mut conditions = Vec::new();
    if query.symbol.is_some() {
        conditions.push("symbol = ?");
    }
    if query.from_ms.is_some() {
        conditions.push("event_time >= fromUnixTimestamp64Milli(?)");
    }
    if query.to_ms.is_some() {
        conditions.push("event_time <= fromUnixTimestamp64Milli(?)");
    }

    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

fn bind_filter(mut q: Query, query: &RecordQuery) -> Query {
    if let Some(symbol) = &query.symbol {
        q = q.bind(symbol.as_str());
    }
    if let Some(from) = query.from_ms {
        q = q.bind(from);
    }
    if let Some(to) = query.to_ms {
        q = q.bind(to);
    }
    q
}

// =============================================================================
// Error Mapping
// =============================================================================

fn is_connection_error(e: &clickhouse::error::Error) -> bool {
    matches!(
        e,
        clickhouse::error::Error::Network(_) | clickhouse::error::Error::TimedOut
    )
}

fn schema_error(e: clickhouse::error::Error) -> StoreError {
    if is_connection_error(&e) {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Schema(e.to_string())
    }
}

fn insert_error(e: clickhouse::error::Error) -> StoreError {
    if is_connection_error(&e) {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Insert(e.to_string())
    }
}

fn query_error(e: clickhouse::error::Error) -> StoreError {
    if is_connection_error(&e) {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Query(e.to_string())
    }
}
