//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::postgres::{HealthResult, PoolMetrics};

use super::{
    DB_HEALTH_LATENCY, DB_HEALTH_STATUS, DB_POOL_ACQUIRE_LATENCY, DB_POOL_ACQUIRE_TIMEOUTS_TOTAL,
    DB_POOL_CONNECTIONS, DB_POOL_ERRORS, DB_POOL_IDLE_CONNECTIONS, DB_POOL_WAITING_CLIENTS,
    DB_QUERIES_TOTAL, DB_QUERY_DURATION, DB_SLOW_QUERIES_TOTAL, PROCESS_MEMORY_BYTES,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Pool gauges mirrored from a snapshot
pub struct PoolGauges;

impl PoolGauges {
    pub fn update(metrics: &PoolMetrics) {
        DB_POOL_CONNECTIONS.set(metrics.total_connections as i64);
        DB_POOL_IDLE_CONNECTIONS.set(metrics.idle_connections as i64);
        DB_POOL_WAITING_CLIENTS.set(metrics.waiting_clients as i64);
        DB_POOL_ERRORS.set(metrics.errors as i64);
    }
}

/// Helper struct for recording acquire metrics
pub struct AcquireMetrics;

impl AcquireMetrics {
    pub fn record_wait(latency_secs: f64) {
        DB_POOL_ACQUIRE_LATENCY.observe(latency_secs);
    }

    pub fn record_timeout() {
        DB_POOL_ACQUIRE_TIMEOUTS_TOTAL.inc();
    }
}

/// Helper struct for recording query metrics
pub struct QueryMetrics;

impl QueryMetrics {
    pub fn record_success(duration_secs: f64) {
        DB_QUERIES_TOTAL.with_label_values(&["success"]).inc();
        DB_QUERY_DURATION.observe(duration_secs);
    }

    pub fn record_failure(duration_secs: f64) {
        DB_QUERIES_TOTAL.with_label_values(&["error"]).inc();
        DB_QUERY_DURATION.observe(duration_secs);
    }

    pub fn record_slow() {
        DB_SLOW_QUERIES_TOTAL.inc();
    }
}

/// Helper struct for health metrics
pub struct HealthMetrics;

impl HealthMetrics {
    pub fn record(health: &HealthResult) {
        DB_HEALTH_STATUS.set(if health.healthy { 1 } else { 0 });
        DB_HEALTH_LATENCY.observe(health.latency_ms / 1000.0);
        PoolGauges::update(&health.metrics);
    }
}

/// Helper struct for memory metrics
pub struct MemoryMetrics;

impl MemoryMetrics {
    /// Refresh the process memory gauge and return the RSS in bytes, when
    /// the platform exposes it.
    pub fn update_process_memory() -> Option<u64> {
        let rss = Self::resident_set_bytes()?;
        PROCESS_MEMORY_BYTES.set(rss as i64);
        Some(rss)
    }

    #[cfg(target_os = "linux")]
    fn resident_set_bytes() -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        status
            .lines()
            .find(|line| line.starts_with("VmRSS:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_set_bytes() -> Option<u64> {
        // Not exposed without platform APIs
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_gauges() {
        PoolGauges::update(&PoolMetrics {
            total_connections: 4,
            idle_connections: 3,
            waiting_clients: 0,
            errors: 1,
        });

        let output = encode_metrics().unwrap();
        assert!(output.contains("gaia_db_pool_idle_connections"));
        assert!(output.contains("gaia_db_pool_waiting_clients"));
    }

    #[test]
    fn test_query_and_acquire_metrics() {
        QueryMetrics::record_success(0.002);
        QueryMetrics::record_failure(0.5);
        QueryMetrics::record_slow();
        AcquireMetrics::record_wait(0.0001);
        AcquireMetrics::record_timeout();
        // Just verify no panics
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_memory_on_linux() {
        let rss = MemoryMetrics::update_process_memory();
        assert!(rss.unwrap_or(0) > 0);
    }
}
