//! Binance WebSocket Adapter
//!
//! Client for the exchange's public market streams:
//!
//! - **Streams**: `aggTrade`, `trade` and partial `depth` frames (JSON codec)
//! - **Control**: `SUBSCRIBE` / `UNSUBSCRIBE` requests and their replies
//! - **Liveness**: ping/pong heartbeat plus rotation before the server's
//!   24 hour connection limit

pub mod age;
pub mod client;
pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod state;

pub use age::{ConnectionAgeMonitor, RotationConfig};
pub use client::{FeedClient, FeedClientConfig, FeedClientError};
pub use codec::{CodecError, FeedCodec};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use messages::*;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use state::{FeedConnectionState, FeedState, FeedStateSnapshot};
