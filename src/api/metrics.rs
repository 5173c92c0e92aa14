//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::error::{AppError, Result};
use crate::metrics::{self, MemoryMetrics, PoolGauges};
use crate::postgres::Connector;
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics<C: Connector>(
    State(state): State<AppState<C>>,
) -> Result<impl IntoResponse> {
    PoolGauges::update(&state.pool.metrics());
    MemoryMetrics::update_process_memory();

    let output = metrics::encode_metrics().map_err(|e| {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        AppError::Internal(format!("Failed to encode metrics: {}", e))
    })?;

    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    ))
}
