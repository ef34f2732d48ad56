//! Ingest Configuration Settings
//!
//! Configuration types for the ingest service, loaded from environment
//! variables.

use std::time::Duration;

use crate::application::services::{AckPolicy, ConsumerConfig, PipelineSettings, RetryPolicy};
use crate::domain::stream::GroupStart;

/// Exchange feed settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// WebSocket endpoint.
    pub ws_url: String,
    /// Streams subscribed after every connect, e.g. `btcusdt@aggTrade`.
    pub streams: Vec<String>,
    /// WebSocket ping interval.
    pub heartbeat_interval: Duration,
    /// Silence tolerated before the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Fixed wait between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Consecutive failed attempts before the client stops.
    pub max_reconnect_attempts: u32,
    /// Maximum lifetime the exchange allows a connection.
    pub max_connection_age: Duration,
    /// How long before `max_connection_age` the connection is rotated.
    pub rotation_margin: Duration,
    /// How often the connection age is checked.
    pub age_check_interval: Duration,
    /// Timeout for the WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            ws_url: "wss://fstream.binance.com/ws".to_string(),
            streams: vec!["btcusdt@aggTrade".to_string()],
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            max_connection_age: Duration::from_secs(24 * 60 * 60),
            rotation_margin: Duration::from_secs(60 * 60),
            age_check_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Stream buffer settings.
#[derive(Clone)]
pub struct StreamSettings {
    /// Redis connection URL. May carry a password.
    pub redis_url: String,
    /// Stream holding feed events.
    pub stream_name: String,
    /// Dead-letter stream for error records.
    pub error_stream: String,
    /// Retained-length cap of the dead-letter stream. `0` never trims.
    pub error_max_len: u64,
    /// Consumer group name.
    pub group: String,
    /// This process's consumer name.
    pub consumer: String,
    /// Where a newly created group starts reading.
    pub group_start: GroupStart,
    /// Retained-length cap.
    pub max_len: u64,
    /// Overshoot tolerated before trimming back to the cap.
    pub trim_slack: u64,
    /// Entries requested per read.
    pub batch_size: usize,
    /// How long an empty read blocks.
    pub block_timeout: Duration,
    /// Idle time after which pending entries are reclaimed.
    pub pending_timeout: Duration,
    /// How often stale pending entries are checked.
    pub claim_interval: Duration,
    /// Age after which acknowledged entries are pruned. `None` disables it.
    pub retention: Option<Duration>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            stream_name: "trades".to_string(),
            error_stream: "trades:errors".to_string(),
            error_max_len: 0,
            group: "trades_read_group".to_string(),
            consumer: "ingest".to_string(),
            group_start: GroupStart::Beginning,
            max_len: 2000,
            trim_slack: 1000,
            batch_size: 100,
            block_timeout: Duration::from_millis(1000),
            pending_timeout: Duration::from_secs(60),
            claim_interval: Duration::from_secs(30),
            retention: None,
        }
    }
}

impl std::fmt::Debug for StreamSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSettings")
            .field("redis_url", &"[REDACTED]")
            .field("stream_name", &self.stream_name)
            .field("error_stream", &self.error_stream)
            .field("error_max_len", &self.error_max_len)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("group_start", &self.group_start)
            .field("max_len", &self.max_len)
            .field("trim_slack", &self.trim_slack)
            .field("batch_size", &self.batch_size)
            .field("block_timeout", &self.block_timeout)
            .field("pending_timeout", &self.pending_timeout)
            .field("claim_interval", &self.claim_interval)
            .field("retention", &self.retention)
            .finish()
    }
}

/// Columnar store settings.
#[derive(Clone)]
pub struct StoreSettings {
    /// ClickHouse HTTP endpoint.
    pub url: String,
    /// User name.
    pub user: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Database holding the tables.
    pub database: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            user: None,
            password: None,
            database: "crypto_data".to_string(),
        }
    }
}

impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .finish()
    }
}

/// Batch and write settings.
#[derive(Debug, Clone)]
pub struct WriterSettings {
    /// Records per size-triggered flush.
    pub flush_threshold: usize,
    /// Maximum wait before a timed flush.
    pub flush_interval: Duration,
    /// Retries after the first failed insert or append.
    pub max_retries: u32,
    /// Fixed wait between retries.
    pub retry_delay: Duration,
    /// Behavior after retry exhaustion.
    pub ack_policy: AckPolicy,
    /// Error channel capacity.
    pub error_channel_capacity: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            flush_threshold: 100,
            flush_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_millis(5000),
            ack_policy: AckPolicy::AckAfterExhaustion,
            error_channel_capacity: 1024,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete ingest configuration.
#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    /// Use in-memory buffer and store instead of Redis and ClickHouse.
    pub local_mode: bool,
    /// Exchange feed settings.
    pub feed: FeedSettings,
    /// Stream buffer settings.
    pub stream: StreamSettings,
    /// Columnar store settings.
    pub store: StoreSettings,
    /// Batch and write settings.
    pub writer: WriterSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl IngestConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or
    /// the resulting configuration is inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`IngestConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let local_mode = env.bool("INGEST_LOCAL_MODE", false);

        let feed_defaults = FeedSettings::default();
        let feed = FeedSettings {
            ws_url: env.string("BINANCE_WS_URL", &feed_defaults.ws_url),
            streams: env.list("INGEST_STREAMS").unwrap_or(feed_defaults.streams),
            heartbeat_interval: env.secs(
                "INGEST_HEARTBEAT_INTERVAL_SECS",
                feed_defaults.heartbeat_interval,
            ),
            heartbeat_timeout: env.secs(
                "INGEST_HEARTBEAT_TIMEOUT_SECS",
                feed_defaults.heartbeat_timeout,
            ),
            reconnect_delay: env.secs("INGEST_RECONNECT_DELAY_SECS", feed_defaults.reconnect_delay),
            max_reconnect_attempts: env.parse(
                "INGEST_MAX_RECONNECT_ATTEMPTS",
                feed_defaults.max_reconnect_attempts,
            ),
            max_connection_age: env.secs(
                "INGEST_MAX_CONNECTION_AGE_SECS",
                feed_defaults.max_connection_age,
            ),
            rotation_margin: env.secs("INGEST_ROTATION_MARGIN_SECS", feed_defaults.rotation_margin),
            age_check_interval: env.secs(
                "INGEST_AGE_CHECK_INTERVAL_SECS",
                feed_defaults.age_check_interval,
            ),
            connect_timeout: env.secs("INGEST_CONNECT_TIMEOUT_SECS", feed_defaults.connect_timeout),
        };

        let stream_defaults = StreamSettings::default();
        let redis_url = if local_mode {
            env.string("REDIS_URL", &stream_defaults.redis_url)
        } else {
            env.required("REDIS_URL")?
        };
        let stream_name = env.string("INGEST_STREAM_NAME", &stream_defaults.stream_name);
        let stream = StreamSettings {
            redis_url,
            error_stream: env.string("INGEST_ERROR_STREAM", &format!("{stream_name}:errors")),
            error_max_len: env.parse("INGEST_ERROR_STREAM_MAX_LEN", stream_defaults.error_max_len),
            stream_name,
            group: env.string("INGEST_GROUP", &stream_defaults.group),
            consumer: env
                .get("INGEST_CONSUMER")
                .unwrap_or_else(|| default_consumer_name(env.get("HOSTNAME"))),
            group_start: env
                .get("INGEST_GROUP_START")
                .map_or(stream_defaults.group_start, |s| {
                    GroupStart::from_str_case_insensitive(&s)
                }),
            max_len: env.parse("INGEST_STREAM_MAX_LEN", stream_defaults.max_len),
            trim_slack: env.parse("INGEST_STREAM_TRIM_SLACK", stream_defaults.trim_slack),
            batch_size: env.parse("INGEST_CONSUME_BATCH_SIZE", stream_defaults.batch_size),
            block_timeout: env.millis("INGEST_BLOCK_TIMEOUT_MS", stream_defaults.block_timeout),
            pending_timeout: env.secs(
                "INGEST_PENDING_TIMEOUT_SECS",
                stream_defaults.pending_timeout,
            ),
            claim_interval: env.secs("INGEST_CLAIM_INTERVAL_SECS", stream_defaults.claim_interval),
            retention: env
                .get("INGEST_STREAM_RETENTION_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .or(stream_defaults.retention),
        };

        let store_defaults = StoreSettings::default();
        let store = StoreSettings {
            url: if local_mode {
                env.string("CLICKHOUSE_URL", &store_defaults.url)
            } else {
                env.required("CLICKHOUSE_URL")?
            },
            user: env.get("CLICKHOUSE_USER"),
            password: env.get("CLICKHOUSE_PASSWORD"),
            database: env.string("CLICKHOUSE_DATABASE", &store_defaults.database),
        };

        let writer_defaults = WriterSettings::default();
        let writer = WriterSettings {
            flush_threshold: env.parse("INGEST_FLUSH_THRESHOLD", writer_defaults.flush_threshold),
            flush_interval: env.secs("INGEST_FLUSH_INTERVAL_SECS", writer_defaults.flush_interval),
            max_retries: env.parse("INGEST_MAX_RETRIES", writer_defaults.max_retries),
            retry_delay: env.millis("INGEST_RETRY_DELAY_MS", writer_defaults.retry_delay),
            ack_policy: env
                .get("INGEST_ACK_POLICY")
                .map_or(writer_defaults.ack_policy, |s| {
                    AckPolicy::from_str_case_insensitive(&s)
                }),
            error_channel_capacity: env.parse(
                "INGEST_ERROR_CHANNEL_CAPACITY",
                writer_defaults.error_channel_capacity,
            ),
        };

        let server = ServerSettings {
            health_port: env.parse("INGEST_HEALTH_PORT", ServerSettings::default().health_port),
        };

        let config = Self {
            local_mode,
            feed,
            stream,
            store,
            writer,
            server,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.streams.is_empty() {
            return Err(ConfigError::Invalid("INGEST_STREAMS", "no streams".into()));
        }
        if self.stream.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "INGEST_CONSUME_BATCH_SIZE",
                "must be positive".into(),
            ));
        }
        if self.stream.max_len == 0 {
            return Err(ConfigError::Invalid(
                "INGEST_STREAM_MAX_LEN",
                "must be positive".into(),
            ));
        }
        if self.writer.flush_threshold == 0 {
            return Err(ConfigError::Invalid(
                "INGEST_FLUSH_THRESHOLD",
                "must be positive".into(),
            ));
        }
        if self.writer.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "INGEST_FLUSH_INTERVAL_SECS",
                "must be positive".into(),
            ));
        }
        let held = self.longest_pending_hold();
        if self.stream.pending_timeout <= held {
            return Err(ConfigError::Invalid(
                "INGEST_PENDING_TIMEOUT_SECS",
                format!(
                    "{:?} must exceed the flush interval plus write retries {held:?}",
                    self.stream.pending_timeout
                ),
            ));
        }
        if self.feed.rotation_margin >= self.feed.max_connection_age {
            return Err(ConfigError::Invalid(
                "INGEST_ROTATION_MARGIN_SECS",
                "must be smaller than the maximum connection age".into(),
            ));
        }
        Ok(())
    }

    /// Longest time a live consumer keeps an entry pending: a full flush
    /// interval plus every retry wait of the write.
    #[must_use]
    pub fn longest_pending_hold(&self) -> Duration {
        self.writer.flush_interval
            + self
                .writer
                .retry_delay
                .saturating_mul(self.writer.max_retries)
    }

    /// Consumer loop configuration.
    #[must_use]
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            group: self.stream.group.clone(),
            consumer: self.stream.consumer.clone(),
            group_start: self.stream.group_start,
            batch_size: self.stream.batch_size,
            block_timeout: self.stream.block_timeout,
            flush_threshold: self.writer.flush_threshold,
            flush_interval: self.writer.flush_interval,
            pending_timeout: self.stream.pending_timeout,
            claim_interval: self.stream.claim_interval,
            retry_delay: self.writer.retry_delay.min(Duration::from_secs(1)),
            retention: self.stream.retention,
        }
    }

    /// Retry policy shared by store inserts and buffer appends.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.writer.max_retries, self.writer.retry_delay)
    }

    /// Settings for every pipeline stage.
    #[must_use]
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            consumer: self.consumer_config(),
            write_retry: self.retry_policy(),
            produce_retry: self.retry_policy(),
            ack_policy: self.writer.ack_policy,
            error_capacity: self.writer.error_channel_capacity,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// A setting is out of range or inconsistent with another.
    #[error("invalid {0}: {1}")]
    Invalid(&'static str, String),
}

fn default_consumer_name(hostname: Option<String>) -> String {
    let host = hostname
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "ingest".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        let items: Vec<String> = self
            .get(key)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        (!items.is_empty()).then_some(items)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map_or(default, |v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
