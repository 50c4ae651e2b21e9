//! Optional HTTP surface (ambient): `/health` and `/metrics`, served only
//! when `--http-addr` is given and the `http` feature is enabled.

use crate::metrics::MetricsSink;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Prometheus counters/gauges/histogram exposed at `/metrics`.
pub struct BridgeMetrics {
    pub reads_total: IntCounter,
    pub errors_total: IntCounter,
    pub publishes_total: IntCounter,
    pub publish_errors_total: IntCounter,
    pub gateway_online: IntGauge,
    pub read_duration_seconds: Histogram,
    registry: Registry,
}

impl BridgeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reads_total = IntCounter::with_opts(Opts::new("reads_total", "Total register group reads attempted"))?;
        let errors_total = IntCounter::with_opts(Opts::new("errors_total", "Total register group read errors"))?;
        let publishes_total = IntCounter::with_opts(Opts::new("publishes_total", "Total sensor state publishes"))?;
        let publish_errors_total =
            IntCounter::with_opts(Opts::new("publish_errors_total", "Total sensor state publish errors"))?;
        let gateway_online = IntGauge::with_opts(Opts::new("gateway_online", "1 if the gateway transport is connected"))?;
        let read_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "read_duration_seconds",
            "Register group read duration in seconds",
        ))?;

        registry.register(Box::new(reads_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(publishes_total.clone()))?;
        registry.register(Box::new(publish_errors_total.clone()))?;
        registry.register(Box::new(gateway_online.clone()))?;
        registry.register(Box::new(read_duration_seconds.clone()))?;

        Ok(Self {
            reads_total,
            errors_total,
            publishes_total,
            publish_errors_total,
            gateway_online,
            read_duration_seconds,
            registry,
        })
    }

    fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).unwrap_or_default();
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl MetricsSink for BridgeMetrics {
    fn record_read(&self, ok: bool, duration: Duration) {
        self.reads_total.inc();
        if !ok {
            self.errors_total.inc();
        }
        self.read_duration_seconds.observe(duration.as_secs_f64());
    }

    fn record_publish(&self, ok: bool) {
        self.publishes_total.inc();
        if !ok {
            self.publish_errors_total.inc();
        }
    }

    fn set_gateway_online(&self, online: bool) {
        self.gateway_online.set(if online { 1 } else { 0 });
    }
}

/// Liveness/health snapshot backing `/health`, updated by the scheduler
/// loop as it records successes and errors.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub gateway_online: bool,
    pub last_successful_poll: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub success_count: u64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            gateway_online: false,
            last_successful_poll: None,
            error_count: 0,
            success_count: 0,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    uptime_seconds: u64,
    gateway_online: bool,
    last_successful_poll: Option<DateTime<Utc>>,
    error_count: u64,
    success_count: u64,
    version: &'static str,
}

struct AppState {
    metrics: Arc<BridgeMetrics>,
    health: Arc<RwLock<HealthState>>,
    started_at: Instant,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health.read().await;
    let status = if health.gateway_online { "ok" } else { "degraded" };
    let code = if health.gateway_online {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status,
        timestamp: Utc::now(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        gateway_online: health.gateway_online,
        last_successful_poll: health.last_successful_poll,
        error_count: health.error_count,
        success_count: health.success_count,
        version: crate::VERSION,
    };
    (code, Json(body))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.encode())
}

/// Builds the `/health` + `/metrics` router and serves it on `addr` until
/// the process exits.
pub async fn serve(
    addr: &str,
    metrics: Arc<BridgeMetrics>,
    health: Arc<RwLock<HealthState>>,
) -> std::io::Result<()> {
    let state = Arc::new(AppState {
        metrics,
        health,
        started_at: Instant::now(),
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http endpoints listening");
    axum::serve(listener, app).await
}
