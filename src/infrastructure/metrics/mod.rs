//! Prometheus metrics for the API server.
//!
//! - Pool metrics (connections, idle, waiting clients, errors)
//! - Acquire latency and timeouts
//! - Query latency, outcomes and slow queries
//! - Health and process metrics

mod helpers;

pub use helpers::{encode_metrics, AcquireMetrics, HealthMetrics, MemoryMetrics, PoolGauges, QueryMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "gaia";

lazy_static! {
    // ============================================================================
    // Pool Metrics
    // ============================================================================

    /// Live physical connections (idle + leased)
    pub static ref DB_POOL_CONNECTIONS: IntGauge = register_int_gauge!(
        format!("{}_db_pool_connections", METRIC_PREFIX),
        "Live database connections, idle and leased"
    ).unwrap();

    /// Idle connections
    pub static ref DB_POOL_IDLE_CONNECTIONS: IntGauge = register_int_gauge!(
        format!("{}_db_pool_idle_connections", METRIC_PREFIX),
        "Idle database connections"
    ).unwrap();

    /// Callers waiting for a connection
    pub static ref DB_POOL_WAITING_CLIENTS: IntGauge = register_int_gauge!(
        format!("{}_db_pool_waiting_clients", METRIC_PREFIX),
        "Callers waiting for a database connection"
    ).unwrap();

    /// Cumulative connect and connection-level errors
    pub static ref DB_POOL_ERRORS: IntGauge = register_int_gauge!(
        format!("{}_db_pool_errors", METRIC_PREFIX),
        "Cumulative database connection errors"
    ).unwrap();

    /// Time from acquire call to lease
    pub static ref DB_POOL_ACQUIRE_LATENCY: Histogram = register_histogram!(
        format!("{}_db_pool_acquire_latency_seconds", METRIC_PREFIX),
        "Connection acquire latency in seconds",
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0]
    ).unwrap();

    /// Acquisitions that hit the connect timeout
    pub static ref DB_POOL_ACQUIRE_TIMEOUTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_db_pool_acquire_timeouts_total", METRIC_PREFIX),
        "Total connection acquisitions that timed out"
    ).unwrap();

    // ============================================================================
    // Query Metrics
    // ============================================================================

    /// Queries by outcome
    pub static ref DB_QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_db_queries_total", METRIC_PREFIX),
        "Total database queries",
        &["outcome"]
    ).unwrap();

    /// Query execution time
    pub static ref DB_QUERY_DURATION: Histogram = register_histogram!(
        format!("{}_db_query_duration_seconds", METRIC_PREFIX),
        "Database query duration in seconds",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();

    /// Queries over the slow-query threshold
    pub static ref DB_SLOW_QUERIES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_db_slow_queries_total", METRIC_PREFIX),
        "Total queries slower than the configured threshold"
    ).unwrap();

    // ============================================================================
    // Health & Process Metrics
    // ============================================================================

    /// Database health (1 = healthy, 0 = unhealthy)
    pub static ref DB_HEALTH_STATUS: IntGauge = register_int_gauge!(
        format!("{}_db_health_status", METRIC_PREFIX),
        "Database health status (1=healthy, 0=unhealthy)"
    ).unwrap();

    /// Latency of the last health check
    pub static ref DB_HEALTH_LATENCY: Histogram = register_histogram!(
        format!("{}_db_health_latency_seconds", METRIC_PREFIX),
        "Database health check latency in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0]
    ).unwrap();

    /// Process memory usage (resident set size) in bytes
    pub static ref PROCESS_MEMORY_BYTES: IntGauge = register_int_gauge!(
        format!("{}_process_memory_bytes", METRIC_PREFIX),
        "Process memory usage (RSS) in bytes"
    ).unwrap();
}
