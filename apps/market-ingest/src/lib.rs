#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Ingest - Real-time Market Data Pipeline
//!
//! Captures the exchange's WebSocket market streams, buffers every event in
//! a capped Redis stream read through a consumer group, and writes batches
//! into ClickHouse. An entry is acknowledged only after the batch holding it
//! is durable (or routed to the error stream), so a crash between read and
//! write redelivers instead of losing data.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core ingestion types
//!   - `stream`: Entry ids, entries, consumer-group vocabulary
//!   - `market`: Market events parsed from the feed
//!   - `records`: Store rows and error records
//!   - `batch`: Size-capped batch accumulation
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Stream buffer and record store interfaces
//!   - `services`: Forwarder, consumer, writer, error channel, pipeline
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: WebSocket feed client
//!   - `redis`: Redis Streams buffer
//!   - `clickhouse`: Columnar record store
//!   - `memory`: In-memory buffer and store
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                    ┌───────────┐      ┌──────────────┐
//! Binance WS ──────► │ Forwarder │ ───► │ Redis stream │
//!  (FeedClient)      └───────────┘      │  (capped)    │
//!                                       └──────┬───────┘
//!                                              │ XREADGROUP
//!                    ┌────────────┐     ┌──────▼───────┐
//!    ClickHouse ◄─── │   Writer   │ ◄── │   Consumer   │
//!                    └─────┬──────┘     │ (accumulator)│
//!                          │ XACK       └──────────────┘
//!                          ▼
//!                   error channel ───► error stream
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core ingestion types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{AggTrade, BookLevel, DepthUpdate, MarketEvent, Trade};
pub use domain::records::{
    BookSnapshotRecord, ErrorKind, ErrorRecord, StoredRecord, TradeRecord,
};
pub use domain::stream::{ClaimResult, EntryId, GroupStart, StreamEntry, StreamInfo};

// Ports
pub use application::ports::{
    BufferError, RecordQuery, RecordReader, RecordStore, StoreError, StreamBuffer, TradeStats,
};

// Pipeline (for integration tests)
pub use application::services::{
    AckPolicy, FlushOutcome, Pipeline, PipelineContext, PipelineError, PipelineMonitor,
    PipelineReport, PipelineSettings, PipelineStats, RetryPolicy,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, FeedSettings, IngestConfig, ServerSettings, StoreSettings, StreamSettings,
    WriterSettings,
};

// Adapters
pub use infrastructure::binance::{
    FeedClient, FeedClientConfig, FeedClientError, FeedConnectionState, FeedState,
};
pub use infrastructure::clickhouse::ClickHouseStore;
pub use infrastructure::memory::{InMemoryRecordStore, InMemoryStreamBuffer};
pub use infrastructure::redis::{RedisStreamBuffer, RedisStreamConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
