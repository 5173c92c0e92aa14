//! Graceful shutdown handling for the API server.
//!
//! The shutdown sequence:
//! 1. Waits for SIGINT or SIGTERM (the HTTP server stops accepting requests)
//! 2. Signals background tasks to stop
//! 3. Drains the connection pool within a bounded grace period

use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;

use crate::postgres::{ConnectionPool, Connector, ShutdownReport};

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for outstanding leases before terminating them (default: 10 seconds)
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Handles graceful shutdown of the API server's resources
pub struct GracefulShutdown<C: Connector> {
    pool: ConnectionPool<C>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl<C: Connector> GracefulShutdown<C> {
    pub fn with_config(
        pool: ConnectionPool<C>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            pool,
            shutdown_tx,
            config,
        }
    }

    /// Execute the shutdown sequence.
    ///
    /// Forced termination of leases is reported, never raised: the process
    /// still exits cleanly.
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.pool.metrics().total_connections)
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Stopping background tasks");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 2: Draining database connection pool");
        let pool = self.pool.shutdown(self.config.drain_timeout).await;

        let result = ShutdownResult {
            pool_forced: pool.was_forced(),
            pool,
            duration: start.elapsed(),
        };

        if result.pool_forced {
            tracing::warn!(
                forced_leases = result.pool.forced_leases,
                "Database connections were terminated after the grace period"
            );
        }

        tracing::info!(
            closed_idle = result.pool.closed_idle,
            drained_leases = result.pool.drained_leases,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether any lease had to be terminated
    pub pool_forced: bool,
    pub pool: ShutdownReport,
    /// Total time taken for shutdown
    pub duration: Duration,
}

/// Resolves when the process receives Ctrl+C or SIGTERM. Returns the
/// signal name for logging.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("SIGINT received, shutting down gracefully");
            "SIGINT"
        }
        _ = terminate => {
            tracing::info!("SIGTERM received, shutting down gracefully");
            "SIGTERM"
        }
    }
}
