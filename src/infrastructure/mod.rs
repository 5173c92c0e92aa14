//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `metrics`: Prometheus metrics helpers
//! - `postgres`: PostgreSQL connection pool, leases and health checks

pub mod metrics;
pub mod postgres;
