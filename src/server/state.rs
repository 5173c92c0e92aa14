use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::postgres::{ConnectionPool, Connector, PgConnector};

/// Shared state handed to every request handler.
///
/// The pool is owned here and passed by handle; there is no global pool.
pub struct AppState<C: Connector = PgConnector> {
    pub settings: Arc<Settings>,
    pub pool: ConnectionPool<C>,
    pub start_time: Instant,
}

impl<C: Connector> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            pool: self.pool.clone(),
            start_time: self.start_time,
        }
    }
}

impl AppState<PgConnector> {
    /// Build state with a PostgreSQL pool from configuration.
    pub fn new(settings: Settings) -> Self {
        let connector = PgConnector::new(&settings.database);
        let pool = ConnectionPool::new(connector, settings.database.pool_options());
        Self::with_pool(settings, pool)
    }
}

impl<C: Connector> AppState<C> {
    pub fn with_pool(settings: Settings, pool: ConnectionPool<C>) -> Self {
        Self {
            settings: Arc::new(settings),
            pool,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
