//! Market Ingest Binary
//!
//! Starts the feed client, the ingestion pipeline and the health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-ingest
//! ```
//!
//! # Environment Variables
//!
//! ## Required (unless `INGEST_LOCAL_MODE=true`)
//! - `REDIS_URL`: Redis connection URL
//! - `CLICKHOUSE_URL`: ClickHouse HTTP endpoint
//!
//! ## Optional
//! - `BINANCE_WS_URL`: Feed endpoint (default: wss://fstream.binance.com/ws)
//! - `INGEST_STREAMS`: Comma-separated streams (default: btcusdt@aggTrade)
//! - `INGEST_STREAM_NAME`: Buffer stream key (default: trades)
//! - `INGEST_FLUSH_THRESHOLD`: Records per batch (default: 100)
//! - `INGEST_FLUSH_INTERVAL_SECS`: Time trigger (default: 5)
//! - `INGEST_ACK_POLICY`: ack | redeliver (default: ack)
//! - `INGEST_ERROR_STREAM_MAX_LEN`: Dead-letter cap, 0 keeps everything (default: 0)
//! - `INGEST_STREAM_RETENTION_SECS`: Prune acknowledged entries older than this, 0 disables (default: 0)
//! - `INGEST_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_ingest::application::ports::{RecordStore, StreamBuffer};
use market_ingest::infrastructure::binance::{FeedClient, FeedClientConfig};
use market_ingest::infrastructure::health::{HealthServer, HealthServerState};
use market_ingest::infrastructure::redis::{RedisStreamBuffer, RedisStreamConfig};
use market_ingest::infrastructure::telemetry;
use market_ingest::{
    ClickHouseStore, InMemoryRecordStore, InMemoryStreamBuffer, IngestConfig, Pipeline,
    PipelineContext, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the feed client's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let telemetry_guard = telemetry::init();

    tracing::info!(
        otel_export = telemetry_guard.exporting(),
        "Starting Market Ingest"
    );

    let _metrics_handle = init_metrics();

    let config = IngestConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let (buffer, dead_letters, store) = build_adapters(&config).await?;

    // Feed client
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let feed_client = Arc::new(FeedClient::new(
        FeedClientConfig::from_feed_settings(&config.feed),
        event_tx,
        shutdown_token.clone(),
    ));

    // Pipeline
    let pipeline = Pipeline::start(
        PipelineContext {
            buffer: Arc::clone(&buffer),
            dead_letters,
            store: Arc::clone(&store),
            settings: config.pipeline_settings(),
            cancel: shutdown_token.clone(),
        },
        event_rx,
    )
    .await
    .context("failed to start pipeline")?;

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        feed_client.feed_state(),
        buffer,
        store,
        config.stream.group.clone(),
        pipeline.monitor(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    let feed_task = tokio::spawn({
        let feed_client = Arc::clone(&feed_client);
        async move {
            if let Err(e) = feed_client.run().await {
                tracing::error!(error = %e, "Feed client stopped");
            }
        }
    });

    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Market ingest ready");

    await_shutdown(shutdown_token).await;

    let report = tokio::time::timeout(SHUTDOWN_TIMEOUT, async move {
        let report = pipeline.shutdown().await;
        for (name, task) in [("feed_client", feed_task), ("health_server", health_task)] {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Task failed");
            }
        }
        report
    })
    .await;

    match report {
        Ok(report) => tracing::info!(
            final_flush = ?report.final_flush,
            records_written = report.stats.records_written,
            entries_acked = report.stats.entries_acked,
            "Market ingest stopped"
        ),
        Err(_) => tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out"
        ),
    }

    Ok(())
}

type Adapters = (
    Arc<dyn StreamBuffer>,
    Arc<dyn StreamBuffer>,
    Arc<dyn RecordStore>,
);

/// Connect the buffer, the dead-letter stream and the store.
async fn build_adapters(config: &IngestConfig) -> anyhow::Result<Adapters> {
    let stream = &config.stream;

    if config.local_mode {
        tracing::warn!("Local mode: using in-memory buffer and store");
        return Ok((
            Arc::new(InMemoryStreamBuffer::new(stream.max_len, stream.trim_slack)),
            Arc::new(InMemoryStreamBuffer::new(stream.error_max_len, 0)),
            Arc::new(InMemoryRecordStore::new()),
        ));
    }

    let buffer = RedisStreamBuffer::connect(
        &stream.redis_url,
        RedisStreamConfig::new(&stream.stream_name, stream.max_len, stream.trim_slack),
    )
    .await
    .context("failed to connect to Redis")?;
    let dead_letters = buffer.sibling(RedisStreamConfig::new(
        &stream.error_stream,
        stream.error_max_len,
        0,
    ));
    tracing::info!(
        stream = buffer.stream_name(),
        error_stream = dead_letters.stream_name(),
        error_max_len = stream.error_max_len,
        "Stream buffers ready"
    );
    let store = ClickHouseStore::new(&config.store);
    store.ping().await.context("failed to reach ClickHouse")?;

    Ok((Arc::new(buffer), Arc::new(dead_letters), Arc::new(store)))
}

/// Log the parsed configuration.
fn log_config(config: &IngestConfig) {
    tracing::info!(
        local_mode = config.local_mode,
        streams = ?config.feed.streams,
        stream = %config.stream.stream_name,
        group = %config.stream.group,
        consumer = %config.stream.consumer,
        retention_secs = config.stream.retention.map(|r| r.as_secs()),
        database = %config.store.database,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(config = ?config, "Full configuration");
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
