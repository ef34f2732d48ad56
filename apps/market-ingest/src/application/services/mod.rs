//! Application Services
//!
//! Pipeline stages built on the ports:
//!
//! - `FeedForwarder`: feed events → stream buffer
//! - `StreamConsumer`: stream buffer → batch accumulator
//! - `StoreWriter`: batch → record store, then acknowledge
//! - `ErrorDrain`: error channel → dead-letter stream
//! - `Pipeline`: wires the stages together and shuts them down in order

mod consumer;
mod errors;
mod forwarder;
mod pipeline;
mod retry;
mod transform;
mod writer;

pub use consumer::{ConsumerConfig, ConsumerStats, StreamConsumer};
pub use errors::{ErrorChannelStats, ErrorDrain, ErrorReporter, error_channel};
pub use forwarder::{FeedForwarder, ForwarderStats};
pub use pipeline::{
    Pipeline, PipelineContext, PipelineError, PipelineMonitor, PipelineReport, PipelineSettings,
    PipelineStats,
};
pub use retry::{RetryOutcome, RetryPolicy, retry_with};
pub use transform::{TransformError, payload_symbol, transform_event, transform_payload};
pub use writer::{AckPolicy, FlushOutcome, StoreWriter, WriterConfig, WriterStats};
