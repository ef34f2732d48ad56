//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Binance WebSocket feed client.
pub mod binance;

/// ClickHouse record store.
pub mod clickhouse;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// In-memory buffer and store for local mode and tests.
pub mod memory;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Redis Streams buffer.
pub mod redis;

/// OpenTelemetry tracing integration.
pub mod telemetry;
