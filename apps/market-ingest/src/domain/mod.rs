//! Domain Layer - Core ingestion types and business logic.
//!
//! This layer contains the canonical types that flow through the pipeline:
//! market events as parsed from the feed, stream entries as stored in the
//! durable buffer, records as written to the columnar store, and the batch
//! accumulator that groups them.

/// Stream entry identifiers, entries, and consumer-group vocabulary.
pub mod stream;

/// Codec-agnostic market events (trades, aggregate trades, depth).
pub mod market;

/// Store records and error records.
pub mod records;

/// Batch accumulation with a size ceiling.
pub mod batch;
