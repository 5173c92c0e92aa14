//! Snapshot and result types exposed by the connection pool.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

/// Pool lifecycle states.
///
/// A pool starts in `Ready` once constructed. Only `Ready` admits new
/// acquisitions; `Draining` lets outstanding leases finish; `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Ready = 0,
    Draining = 1,
    Closed = 2,
}

impl From<u8> for PoolState {
    fn from(value: u8) -> Self {
        match value {
            0 => PoolState::Ready,
            1 => PoolState::Draining,
            _ => PoolState::Closed,
        }
    }
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Ready => "ready",
            PoolState::Draining => "draining",
            PoolState::Closed => "closed",
        }
    }
}

/// Point-in-time view of pool utilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    /// Live physical connections, idle and leased
    pub total_connections: usize,
    pub idle_connections: usize,
    /// Callers currently queued for a connection
    pub waiting_clients: usize,
    /// Cumulative connect and connection-level failures
    pub errors: u64,
}

impl PoolMetrics {
    pub fn leased_connections(&self) -> usize {
        self.total_connections.saturating_sub(self.idle_connections)
    }
}

/// Outcome of a single best-effort health check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResult {
    pub healthy: bool,
    pub metrics: PoolMetrics,
    /// Wall-clock time of acquire + ping + release in milliseconds
    #[serde(rename = "latency")]
    pub latency_ms: f64,
}

/// Tabular result of a statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    /// Rows returned or affected
    pub row_count: u64,
}

impl QueryOutput {
    /// First column of the first row, the usual shape of scalar queries.
    pub fn scalar(&self) -> Option<&Value> {
        let first = self.columns.first()?;
        self.rows.first()?.get(first)
    }
}

/// Summary of a pool shutdown.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Idle connections closed at the start of the drain
    pub closed_idle: usize,
    /// Leases that were returned within the grace period
    pub drained_leases: usize,
    /// Leases still outstanding when the grace period elapsed
    pub forced_leases: usize,
    pub duration: Duration,
}

impl ShutdownReport {
    pub fn was_forced(&self) -> bool {
        self.forced_leases > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pool_state_from_u8() {
        assert_eq!(PoolState::from(0), PoolState::Ready);
        assert_eq!(PoolState::from(1), PoolState::Draining);
        assert_eq!(PoolState::from(2), PoolState::Closed);
        assert_eq!(PoolState::from(9), PoolState::Closed);
    }

    #[test]
    fn test_metrics_serialize_camel_case() {
        let metrics = PoolMetrics {
            total_connections: 3,
            idle_connections: 1,
            waiting_clients: 0,
            errors: 2,
        };

        let value = serde_json::to_value(metrics).unwrap();
        assert_eq!(
            value,
            json!({
                "totalConnections": 3,
                "idleConnections": 1,
                "waitingClients": 0,
                "errors": 2
            })
        );
        assert_eq!(metrics.leased_connections(), 2);
    }

    #[test]
    fn test_scalar() {
        let mut row = Map::new();
        row.insert("number".to_string(), json!(1));
        let output = QueryOutput {
            columns: vec!["number".to_string()],
            rows: vec![row],
            row_count: 1,
        };
        assert_eq!(output.scalar(), Some(&json!(1)));
        assert_eq!(QueryOutput::default().scalar(), None);
    }
}
