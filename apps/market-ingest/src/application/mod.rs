//! Application Layer - Use cases and port definitions.
//!
//! Ports describe what the pipeline needs from the outside world (a durable
//! stream buffer and a record store); services wire the pipeline stages
//! together on top of those ports.

/// Port definitions for the stream buffer and the record store.
pub mod ports;

/// Pipeline services: forwarding, consumption, writing, error routing.
pub mod services;
