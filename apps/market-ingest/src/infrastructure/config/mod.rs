//! Configuration Module
//!
//! Configuration loading for the ingest service.

mod settings;

pub use settings::{
    ConfigError, FeedSettings, IngestConfig, ServerSettings, StoreSettings, StreamSettings,
    WriterSettings,
};
