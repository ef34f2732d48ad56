//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, pipeline status reporting, and
//! Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness check (simple OK)
//! - `GET /readyz` - Kubernetes readiness check (feed and buffer up)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{RecordStore, StreamBuffer};
use crate::application::services::{PipelineMonitor, PipelineStats};
use crate::infrastructure::binance::{FeedConnectionState, FeedState, FeedStateSnapshot};
use crate::infrastructure::metrics::{self, get_metrics_handle};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Names of the dependencies that are not OK.
    pub failing: Vec<String>,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Exchange feed.
    pub feed: FeedStateSnapshot,
    /// Stream buffer.
    pub buffer: BufferStatus,
    /// Record store.
    pub store: StoreStatus,
    /// Pipeline counters.
    pub pipeline: PipelineStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some systems degraded but functional.
    Degraded,
    /// Critical systems unavailable.
    Unhealthy,
}

/// Stream buffer status.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    /// Whether the buffer answered.
    pub reachable: bool,
    /// Retained entries.
    pub length: Option<u64>,
    /// Entries delivered but not acknowledged.
    pub pending: Option<u64>,
}

/// Record store status.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    /// Whether the store answered.
    pub reachable: bool,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    feed: Arc<FeedState>,
    buffer: Arc<dyn StreamBuffer>,
    store: Arc<dyn RecordStore>,
    group: String,
    pipeline: PipelineMonitor,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        feed: Arc<FeedState>,
        buffer: Arc<dyn StreamBuffer>,
        store: Arc<dyn RecordStore>,
        group: String,
        pipeline: PipelineMonitor,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            feed,
            buffer,
            store,
            group,
            pipeline,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by the health server.
#[must_use]
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state).await;
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let feed_connected = state.feed.get_state() == FeedConnectionState::Connected;
    let buffer_reachable = state.buffer.length().await.is_ok();

    if feed_connected && buffer_reachable {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let Some(handle) = get_metrics_handle() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain")],
            "Metrics not initialized".to_string(),
        );
    };

    let buffer = buffer_status(&state).await;
    if let (Some(length), Some(pending)) = (buffer.length, buffer.pending) {
        metrics::set_stream_backlog(length, pending);
    }
    metrics::set_accumulator_records(state.pipeline.snapshot().buffered);

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}

async fn buffer_status(state: &HealthServerState) -> BufferStatus {
    let length = state.buffer.length().await;
    let pending = state.buffer.pending(&state.group).await;
    BufferStatus {
        reachable: length.is_ok(),
        length: length.ok(),
        pending: pending.ok(),
    }
}

async fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let feed = state.feed.snapshot();
    let buffer = buffer_status(state).await;
    let store = StoreStatus {
        reachable: state.store.ping().await.is_ok(),
    };

    let (status, failing) = determine_health_status(feed.state, buffer.reachable, store.reachable);

    HealthResponse {
        status,
        failing,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        feed,
        buffer,
        store,
        pipeline: state.pipeline.snapshot(),
    }
}

/// An unreachable buffer or a stopped feed is unhealthy. A feed between
/// connections or an unreachable store is degraded.
fn determine_health_status(
    feed: FeedConnectionState,
    buffer_reachable: bool,
    store_reachable: bool,
) -> (HealthStatus, Vec<String>) {
    let mut failing = Vec::new();
    let mut status = HealthStatus::Healthy;

    if !buffer_reachable {
        failing.push("buffer".to_string());
        status = HealthStatus::Unhealthy;
    }
    match feed {
        FeedConnectionState::Connected => {}
        FeedConnectionState::Stopped => {
            failing.push("feed".to_string());
            status = HealthStatus::Unhealthy;
        }
        _ => {
            failing.push("feed".to_string());
            if status == HealthStatus::Healthy {
                status = HealthStatus::Degraded;
            }
        }
    }
    if !store_reachable {
        failing.push("store".to_string());
        if status == HealthStatus::Healthy {
            status = HealthStatus::Degraded;
        }
    }

    (status, failing)
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
