//! Redis Streams Buffer
//!
//! `StreamBuffer` over a Redis stream. Each entry stores the JSON payload
//! under a single `data` field.
//!
//! | Operation         | Commands                               |
//! |-------------------|----------------------------------------|
//! | `ensure_group`    | `XGROUP CREATE ... MKSTREAM`           |
//! | `produce`         | `XADD`, then `XLEN` / `XTRIM MAXLEN`   |
//! | `consume`         | `XREADGROUP ... STREAMS <key> >`       |
//! | `ack`             | `XACK`                                 |
//! | `claim_stale`     | `XPENDING`, `XRANGE`, `XCLAIM`, `XACK` |
//! | `info`            | `XLEN`, `XRANGE`, `XREVRANGE`          |
//! | `oldest_unacked`  | `XPENDING`, `XINFO GROUPS`, `XRANGE`   |
//! | `trim_older_than` | `XTRIM MINID`                          |
//!
//! Age trimming and exclusive ranges need Redis 6.2 or later.
//!
//! Blocking reads run on their own connection so a long `BLOCK` never
//! stalls appends and acknowledgements.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamInfoGroupsReply, StreamMaxlen, StreamPendingCountReply,
    StreamPendingReply, StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisError};

use crate::application::ports::{BufferError, StreamBuffer};
use crate::domain::stream::{
    ClaimResult, EntryId, EntryIdError, GroupStart, PAYLOAD_FIELD, StreamEntry, StreamInfo,
};

// =============================================================================
// Configuration
// =============================================================================

/// Stream key and retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStreamConfig {
    /// Stream key.
    pub stream: String,
    /// Retained length after trimming. `0` never trims.
    pub max_len: u64,
    /// Growth allowed past `max_len` before a trim.
    pub trim_slack: u64,
}

impl RedisStreamConfig {
    /// Create a stream configuration.
    #[must_use]
    pub fn new(stream: impl Into<String>, max_len: u64, trim_slack: u64) -> Self {
        Self {
            stream: stream.into(),
            max_len,
            trim_slack,
        }
    }
}

// =============================================================================
// Buffer
// =============================================================================

/// Redis implementation of `StreamBuffer`.
#[derive(Clone)]
pub struct RedisStreamBuffer {
    commands: ConnectionManager,
    reads: ConnectionManager,
    config: RedisStreamConfig,
}

impl RedisStreamBuffer {
    /// Open the command and blocking-read connections.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::Connection` if Redis cannot be reached.
    pub async fn connect(url: &str, config: RedisStreamConfig) -> Result<Self, BufferError> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        let commands = client
            .get_connection_manager()
            .await
            .map_err(map_redis_error)?;
        let reads = client
            .get_connection_manager()
            .await
            .map_err(map_redis_error)?;

        tracing::info!(
            stream = %config.stream,
            max_len = config.max_len,
            trim_slack = config.trim_slack,
            "Connected to Redis"
        );

        Ok(Self {
            commands,
            reads,
            config,
        })
    }

    /// Buffer over another stream key sharing these connections.
    #[must_use]
    pub fn sibling(&self, config: RedisStreamConfig) -> Self {
        Self {
            commands: self.commands.clone(),
            reads: self.reads.clone(),
            config,
        }
    }

    /// Stream key.
    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.config.stream
    }

    fn key(&self) -> &str {
        &self.config.stream
    }

    async fn trim_if_needed(&self) -> Result<(), BufferError> {
        if self.config.max_len == 0 {
            return Ok(());
        }
        let mut conn = self.commands.clone();
        let len: u64 = conn.xlen(self.key()).await.map_err(map_redis_error)?;
        if len <= self.config.max_len.saturating_add(self.config.trim_slack) {
            return Ok(());
        }

        let max_len = usize::try_from(self.config.max_len).unwrap_or(usize::MAX);
        let trimmed: u64 = conn
            .xtrim(self.key(), StreamMaxlen::Equals(max_len))
            .await
            .map_err(map_redis_error)?;
        tracing::debug!(stream = %self.key(), trimmed, "Stream trimmed");
        Ok(())
    }

    async fn range(&self, start: &str, end: &str) -> Result<Option<StreamEntry>, BufferError> {
        let mut conn = self.commands.clone();
        let reply: StreamRangeReply = conn
            .xrange_count(self.key(), start, end, 1)
            .await
            .map_err(map_redis_error)?;
        reply.ids.first().map(to_entry).transpose()
    }
}

#[async_trait]
impl StreamBuffer for RedisStreamBuffer {
    async fn ensure_group(&self, group: &str, start: GroupStart) -> Result<(), BufferError> {
        let mut conn = self.commands.clone();
        let created: Result<(), RedisError> = conn
            .xgroup_create_mkstream(self.key(), group, start.as_start_id())
            .await;

        match created {
            Ok(()) => {
                tracing::info!(
                    stream = %self.key(),
                    group,
                    start = start.as_start_id(),
                    "Consumer group created"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(stream = %self.key(), group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(map_redis_error(e)),
        }
    }

    async fn produce(&self, payload: &str) -> Result<EntryId, BufferError> {
        let mut conn = self.commands.clone();
        let raw: String = conn
            .xadd(self.key(), "*", &[(PAYLOAD_FIELD, payload)])
            .await
            .map_err(map_redis_error)?;
        let id = parse_id(&raw)?;

        if let Err(e) = self.trim_if_needed().await {
            tracing::warn!(stream = %self.key(), error = %e, "Stream trim failed");
        }
        Ok(id)
    }

    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StreamEntry>, BufferError> {
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(batch_size);
        if !block_timeout.is_zero() {
            let block_ms = usize::try_from(block_timeout.as_millis()).unwrap_or(usize::MAX);
            options = options.block(block_ms);
        }

        let mut conn = self.reads.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[self.key()], &[">"], &options)
            .await
            .map_err(|e| map_group_error(e, group))?;

        reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .map(|raw| to_entry(&raw))
            .collect()
    }

    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<u64, BufferError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let raw: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let mut conn = self.commands.clone();
        conn.xack(self.key(), group, &raw)
            .await
            .map_err(map_redis_error)
    }

    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<ClaimResult, BufferError> {
        let mut conn = self.commands.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(self.key(), group, "-", "+", count)
            .await
            .map_err(|e| map_group_error(e, group))?;

        let min_idle_ms = usize::try_from(min_idle.as_millis()).unwrap_or(usize::MAX);
        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return Ok(ClaimResult::default());
        }

        let mut result = ClaimResult::default();
        let mut live = Vec::with_capacity(stale.len());
        for raw in stale {
            if self.range(&raw, &raw).await?.is_some() {
                live.push(raw);
            } else {
                result.deleted.push(parse_id(&raw)?);
            }
        }

        if !result.deleted.is_empty() {
            let removed = self.ack(group, &result.deleted).await?;
            tracing::debug!(stream = %self.key(), removed, "Dropped pending ids of trimmed entries");
        }

        if !live.is_empty() {
            let claimed: StreamClaimReply = conn
                .xclaim(self.key(), group, consumer, min_idle_ms, &live)
                .await
                .map_err(|e| map_group_error(e, group))?;
            result.entries = claimed
                .ids
                .iter()
                .map(to_entry)
                .collect::<Result<_, _>>()?;
        }

        Ok(result)
    }

    async fn length(&self) -> Result<u64, BufferError> {
        let mut conn = self.commands.clone();
        conn.xlen(self.key()).await.map_err(map_redis_error)
    }

    async fn pending(&self, group: &str) -> Result<u64, BufferError> {
        let mut conn = self.commands.clone();
        let reply: StreamPendingReply = conn
            .xpending(self.key(), group)
            .await
            .map_err(|e| map_group_error(e, group))?;
        Ok(reply.count() as u64)
    }

    async fn info(&self) -> Result<StreamInfo, BufferError> {
        let length = self.length().await?;
        let first = self.range("-", "+").await?;

        let mut conn = self.commands.clone();
        let newest: StreamRangeReply = conn
            .xrevrange_count(self.key(), "+", "-", 1)
            .await
            .map_err(map_redis_error)?;
        let last = newest.ids.first().map(to_entry).transpose()?;

        Ok(StreamInfo {
            length,
            first_id: first.map(|e| e.id),
            last_id: last.map(|e| e.id),
            max_len: self.config.max_len,
        })
    }

    async fn latest(&self, count: usize) -> Result<Vec<StreamEntry>, BufferError> {
        let mut conn = self.commands.clone();
        let reply: StreamRangeReply = conn
            .xrevrange_count(self.key(), "+", "-", count)
            .await
            .map_err(map_redis_error)?;
        reply.ids.iter().map(to_entry).collect()
    }

    async fn oldest_unacked(&self, group: &str) -> Result<Option<EntryId>, BufferError> {
        let mut conn = self.commands.clone();
        let summary: StreamPendingReply = conn
            .xpending(self.key(), group)
            .await
            .map_err(|e| map_group_error(e, group))?;
        let pending = match summary {
            StreamPendingReply::Data(data) => Some(parse_id(&data.start_id)?),
            StreamPendingReply::Empty => None,
        };

        let groups: StreamInfoGroupsReply = conn
            .xinfo_groups(self.key())
            .await
            .map_err(|e| map_group_error(e, group))?;
        let cursor = groups
            .groups
            .into_iter()
            .find(|g| g.name == group)
            .ok_or_else(|| BufferError::NoGroup(group.to_string()))?
            .last_delivered_id;
        let undelivered = self
            .range(&format!("({cursor}"), "+")
            .await?
            .map(|e| e.id);

        Ok(match (pending, undelivered) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    async fn trim_older_than(&self, cutoff: EntryId) -> Result<u64, BufferError> {
        let mut conn = self.commands.clone();
        let removed: u64 = redis::cmd("XTRIM")
            .arg(self.key())
            .arg("MINID")
            .arg(cutoff.to_string())
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        tracing::debug!(stream = %self.key(), cutoff = %cutoff, removed, "Stream trimmed by age");
        Ok(removed)
    }
}

// =============================================================================
// Conversions
// =============================================================================

fn parse_id(raw: &str) -> Result<EntryId, BufferError> {
    raw.parse().map_err(|e: EntryIdError| BufferError::MalformedEntry {
        id: raw.to_string(),
        reason: e.to_string(),
    })
}

/// An entry without a `data` field is delivered with an empty payload so
/// it fails the transform and is routed instead of sitting pending forever.
fn to_entry(raw: &StreamId) -> Result<StreamEntry, BufferError> {
    let id = parse_id(&raw.id)?;
    let payload = raw.get::<String>(PAYLOAD_FIELD).unwrap_or_default();
    Ok(StreamEntry::new(id, payload))
}

fn map_redis_error(e: RedisError) -> BufferError {
    let connection = e.is_connection_dropped()
        || e.is_io_error()
        || e.is_timeout()
        || e.is_connection_refusal();
    classify(e.code(), connection, None, e.to_string())
}

fn map_group_error(e: RedisError, group: &str) -> BufferError {
    let connection = e.is_connection_dropped()
        || e.is_io_error()
        || e.is_timeout()
        || e.is_connection_refusal();
    classify(e.code(), connection, Some(group), e.to_string())
}

fn classify(
    code: Option<&str>,
    connection: bool,
    group: Option<&str>,
    message: String,
) -> BufferError {
    if connection {
        return BufferError::Connection(message);
    }
    match (code, group) {
        (Some("NOGROUP"), Some(group)) => BufferError::NoGroup(group.to_string()),
        _ => BufferError::Command(message),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use redis::Value;
    use test_case::test_case;

    fn raw_entry(id: &str, data: Option<&str>) -> StreamId {
        let mut map = HashMap::new();
        if let Some(data) = data {
            map.insert(
                PAYLOAD_FIELD.to_string(),
                Value::BulkString(data.as_bytes().to_vec()),
            );
        }
        StreamId {
            id: id.to_string(),
            map,
        }
    }

    #[test]
    fn entry_carries_data_field() {
        let entry = to_entry(&raw_entry("1700000000000-3", Some("{\"kind\":\"trade\"}"))).unwrap();
        assert_eq!(entry.id, EntryId::new(1_700_000_000_000, 3));
        assert_eq!(entry.payload, "{\"kind\":\"trade\"}");
    }

    #[test]
    fn entry_without_data_has_empty_payload() {
        let entry = to_entry(&raw_entry("5-0", None)).unwrap();
        assert!(entry.payload.is_empty());
    }

    #[test]
    fn unparseable_id_is_malformed() {
        assert!(matches!(
            to_entry(&raw_entry("not-an-id", Some("x"))),
            Err(BufferError::MalformedEntry { .. })
        ));
    }

    #[test_case(None, true, Some("g") => matches BufferError::Connection(_) ; "connection fault")]
    #[test_case(Some("NOGROUP"), false, Some("g") => matches BufferError::NoGroup(_) ; "missing group")]
    #[test_case(Some("NOGROUP"), false, None => matches BufferError::Command(_) ; "nogroup outside group op")]
    #[test_case(Some("WRONGTYPE"), false, Some("g") => matches BufferError::Command(_) ; "other command error")]
    fn classifies_errors(code: Option<&str>, connection: bool, group: Option<&str>) -> BufferError {
        classify(code, connection, group, "boom".to_string())
    }

    #[test]
    fn io_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(map_redis_error(RedisError::from(io)).is_retryable());
    }
}
