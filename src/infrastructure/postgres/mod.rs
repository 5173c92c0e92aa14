//! PostgreSQL persistence module.
//!
//! Provides the bounded connection pool, connection leases, connectivity
//! retry and health tracking for the PostgreSQL backend.

pub mod connector;
mod lease;
pub mod pool;
mod types;

pub use connector::{Connector, DatabaseConnection, PgConnector, PING_QUERY};
pub use lease::{query_preview, ConnectionLease, QUERY_PREVIEW_CHARS};
pub use pool::{ConnectionPool, PoolError, PoolOptions};
pub use types::{HealthResult, PoolMetrics, PoolState, QueryOutput, ShutdownReport};
