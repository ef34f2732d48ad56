//! In-memory adapters.
//!
//! Stand-ins for Redis and ClickHouse used by local mode and by tests.
//! Both can be switched into an unavailable state to exercise the retry
//! and error-routing paths.

mod store;
mod stream;

pub use store::InMemoryRecordStore;
pub use stream::InMemoryStreamBuffer;
