use axum::{routing::get, Router};

use crate::postgres::Connector;
use crate::server::AppState;

use super::health::{api_metrics, health, live, ready};
use super::metrics::prometheus_metrics;

pub fn api_routes<C: Connector>() -> Router<AppState<C>> {
    Router::new()
        // Monitoring & health
        .route("/api/health", get(health::<C>))
        .route("/api/ready", get(ready::<C>))
        .route("/api/live", get(live::<C>))
        .route("/api/metrics", get(api_metrics::<C>))
        // Prometheus scrape
        .route("/metrics", get(prometheus_metrics::<C>))
}
