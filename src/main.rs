use std::process::ExitCode;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use gaia_commons_api::config::Settings;
use gaia_commons_api::postgres::{ConnectionPool, Connector};
use gaia_commons_api::server::{create_app, AppState};
use gaia_commons_api::shutdown::{shutdown_signal, GracefulShutdown, ShutdownConfig};
use gaia_commons_api::tasks::IdleReaperTask;
use gaia_commons_api::telemetry::init_telemetry;

/// Table whose presence indicates the schema has been applied
const SCHEMA_MARKER_TABLE: &str = "pilot_stats";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!(environment = %settings.environment, "Configuration loaded");

    // Create application state (the pool opens connections lazily)
    let state = AppState::new(settings.clone());
    let pool = state.pool.clone();

    // Refuse to start without a database
    let db = &settings.database;
    if !pool
        .test_connectivity(db.startup_retries, db.startup_retry_delay())
        .await
    {
        tracing::error!("Cannot start server without database connection");
        return Ok(ExitCode::FAILURE);
    }

    verify_schema(&pool).await;

    let (shutdown_tx, _) = broadcast::channel(1);

    // Start idle connection reaper in background
    let reaper = IdleReaperTask::new(pool.clone(), shutdown_tx.subscribe());
    let reaper_handle = tokio::spawn(reaper.run());

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Server listening on {}", addr);

    let (signal_tx, mut signal_rx) = tokio::sync::oneshot::channel();

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let signal = shutdown_signal().await;
            let _ = signal_tx.send(signal);
        })
        .await?;

    let reason = signal_rx.try_recv().unwrap_or("server stopped");
    let shutdown = GracefulShutdown::with_config(
        pool,
        shutdown_tx,
        ShutdownConfig {
            drain_timeout: db.shutdown_grace(),
        },
    );
    shutdown.execute(reason).await;

    // Wait for background tasks to finish
    let _ = reaper_handle.await;

    tracing::info!("Server closed");
    Ok(ExitCode::SUCCESS)
}

/// Log whether the schema has been applied. A missing schema is not fatal.
async fn verify_schema<C: Connector>(pool: &ConnectionPool<C>) {
    let sql = "SELECT EXISTS (SELECT FROM information_schema.tables \
               WHERE table_schema = 'public' AND table_name = $1) AS exists";

    match pool.query(sql, &[SCHEMA_MARKER_TABLE.into()]).await {
        Ok(output) => {
            if output.scalar().and_then(|v| v.as_bool()).unwrap_or(false) {
                tracing::info!("Database tables verified");
            } else {
                tracing::warn!(
                    table = SCHEMA_MARKER_TABLE,
                    "Tables not found. Apply schema.sql before serving data routes"
                );
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not verify database schema");
        }
    }
}
