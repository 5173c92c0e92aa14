use std::time::Duration;

use tokio::sync::broadcast;

use crate::metrics::PoolGauges;
use crate::postgres::{ConnectionPool, Connector};

/// Lower bound on the sweep interval so tiny idle timeouts don't spin
const MIN_SWEEP_INTERVAL_MS: u64 = 100;

/// Background task that closes connections idle past the pool's idle timeout
/// and keeps the pool gauges fresh between scrapes.
pub struct IdleReaperTask<C: Connector> {
    pool: ConnectionPool<C>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl<C: Connector> IdleReaperTask<C> {
    pub fn new(pool: ConnectionPool<C>, shutdown: broadcast::Receiver<()>) -> Self {
        let half_timeout = pool.options().idle_timeout.as_millis() as u64 / 2;
        let interval = Duration::from_millis(half_timeout.max(MIN_SWEEP_INTERVAL_MS));

        Self {
            pool,
            interval,
            shutdown,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Idle connection reaper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Idle connection reaper received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    let closed = self.pool.reap_idle().await;
                    if closed > 0 {
                        tracing::debug!(closed, "Closed idle database connections");
                    }
                    PoolGauges::update(&self.pool.metrics());
                }
            }
        }

        tracing::info!("Idle connection reaper stopped");
    }
}
