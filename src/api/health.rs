//! Health, readiness and liveness endpoints.

use std::time::Duration;

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::Serialize;

use crate::metrics::{HealthMetrics, MemoryMetrics};
use crate::postgres::{Connector, PoolMetrics};
use crate::server::AppState;

/// Readiness makes a single attempt and answers right away, so no delay
/// follows a failure.
const READY_RETRY_DELAY: Duration = Duration::ZERO;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub uptime: u64,
    pub database: DatabaseHealthResponse,
    pub memory: MemoryResponse,
    pub version: &'static str,
    pub environment: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseHealthResponse {
    pub connected: bool,
    pub response_time: String,
    pub pool: PoolMetrics,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct LiveResponse {
    pub status: &'static str,
    pub uptime: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub uptime: u64,
    pub database: DatabaseMetricsResponse,
    pub memory: MemoryResponse,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct DatabaseMetricsResponse {
    pub healthy: bool,
    pub latency: f64,
    pub pool: PoolMetrics,
}

#[derive(Debug, Serialize)]
pub struct MemoryResponse {
    /// Resident set size in MB, when the platform exposes it
    pub rss: Option<u64>,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn current_memory() -> MemoryResponse {
    MemoryResponse {
        rss: MemoryMetrics::update_process_memory().map(|bytes| bytes / 1024 / 1024),
    }
}

/// GET /api/health - database-backed health check
pub async fn health<C: Connector>(
    State(state): State<AppState<C>>,
) -> (StatusCode, Json<HealthResponse>) {
    let health = state.pool.check_health().await;
    HealthMetrics::record(&health);

    let status_code = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = HealthResponse {
        status: if health.healthy { "healthy" } else { "unhealthy" },
        timestamp: now(),
        uptime: state.uptime_seconds(),
        database: DatabaseHealthResponse {
            connected: health.healthy,
            response_time: format!("{}ms", health.latency_ms.round() as u64),
            pool: health.metrics,
        },
        memory: current_memory(),
        version: env!("CARGO_PKG_VERSION"),
        environment: state.settings.environment.clone(),
    };

    (status_code, Json(body))
}

/// GET /api/ready - readiness check, queries the database
pub async fn ready<C: Connector>(
    State(state): State<AppState<C>>,
) -> (StatusCode, Json<ReadyResponse>) {
    if state.pool.test_connectivity(1, READY_RETRY_DELAY).await {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                timestamp: Some(now()),
                reason: None,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                timestamp: None,
                reason: Some("database unavailable"),
            }),
        )
    }
}

/// GET /api/live - liveness check, never touches the database
pub async fn live<C: Connector>(State(state): State<AppState<C>>) -> Json<LiveResponse> {
    Json(LiveResponse {
        status: "alive",
        uptime: format!("{}s", state.uptime_seconds()),
        timestamp: now(),
    })
}

/// GET /api/metrics - JSON pool and process metrics
pub async fn api_metrics<C: Connector>(State(state): State<AppState<C>>) -> Json<MetricsResponse> {
    let health = state.pool.check_health().await;
    HealthMetrics::record(&health);

    Json(MetricsResponse {
        uptime: state.uptime_seconds(),
        database: DatabaseMetricsResponse {
            healthy: health.healthy,
            latency: health.latency_ms,
            pool: health.metrics,
        },
        memory: current_memory(),
        timestamp: now(),
    })
}
