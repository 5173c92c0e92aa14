//! API layer - operational HTTP endpoints backed by the connection pool.

mod health;
mod metrics;
mod routes;

pub use health::{
    api_metrics, health, live, ready, DatabaseHealthResponse, DatabaseMetricsResponse,
    HealthResponse, LiveResponse, MemoryResponse, MetricsResponse, ReadyResponse,
};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
