//! Feed Codec
//!
//! Decodes text frames from the Binance futures WebSocket. Raw streams
//! (`/ws/<stream>`) deliver the event object directly; combined streams
//! (`/stream?streams=...`) wrap it as `{"stream": "...", "data": {...}}`.
//! Both shapes are accepted.

use serde_json::Value;

use super::messages::{
    AggTradeMessage, ControlMessage, DepthMessage, ErrorReply, FeedMessage, IGNORED_EVENT_TYPES,
    SubscriptionRequest, TradeMessage,
};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is an object with neither an event type nor a reply id.
    #[error("frame has no event type")]
    MissingEventType,

    /// The frame is not a JSON object.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the futures market streams.
#[derive(Debug, Default, Clone)]
pub struct FeedCodec;

impl FeedCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON, is not an object, or a
    /// known event type is missing required fields.
    pub fn decode(&self, text: &str) -> Result<FeedMessage, CodecError> {
        let value: Value = serde_json::from_str(text.trim())?;
        let value = unwrap_combined(value);

        let Value::Object(object) = &value else {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}",
                preview(text)
            )));
        };
        let event_type = object.get("e").and_then(Value::as_str).map(str::to_string);
        let is_error = object.contains_key("error");
        let is_reply = object.contains_key("result") || object.contains_key("id");

        let message = match event_type.as_deref() {
            Some("aggTrade") => FeedMessage::AggTrade(serde_json::from_value::<AggTradeMessage>(value)?),
            Some("trade") => FeedMessage::Trade(serde_json::from_value::<TradeMessage>(value)?),
            Some("depthUpdate") => FeedMessage::Depth(serde_json::from_value::<DepthMessage>(value)?),
            Some(other) if IGNORED_EVENT_TYPES.contains(&other) => {
                let symbol = object
                    .get("s")
                    .or_else(|| object.get("ps"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                FeedMessage::Ignored {
                    event_type: other.to_string(),
                    symbol,
                }
            }
            Some(other) => FeedMessage::Unsupported(other.to_string()),
            None if is_error => FeedMessage::Error(serde_json::from_value::<ErrorReply>(value)?),
            None if is_reply => FeedMessage::Control(serde_json::from_value::<ControlMessage>(value)?),
            None => return Err(CodecError::MissingEventType),
        };
        Ok(message)
    }

    /// Encode a subscription request.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_request(&self, request: &SubscriptionRequest) -> Result<String, CodecError> {
        Ok(serde_json::to_string(request)?)
    }
}

fn unwrap_combined(value: Value) -> Value {
    match value {
        Value::Object(mut object) if object.contains_key("stream") && object.contains_key("data") => {
            object.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}
