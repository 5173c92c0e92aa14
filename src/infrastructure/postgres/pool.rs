//! Bounded PostgreSQL connection pool with health, retry and metrics.
//!
//! Leases are bounded by a semaphore sized to `max_size`. Returned
//! connections go onto a LIFO idle stack so the most recently used
//! connection is reused first. All counters are updated synchronously by
//! the pool itself on connect, return, close and error.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use crate::metrics::AcquireMetrics;

use super::connector::{Connector, DatabaseConnection};
use super::lease::{ConnectionLease, LeaseSlot};
use super::types::{HealthResult, PoolMetrics, PoolState, QueryOutput, ShutdownReport};

/// Errors surfaced by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Timed out after {waited_ms}ms waiting for a database connection")]
    ConnectTimeout { waited_ms: u64 },

    #[error("Connection pool exhausted: {max_size} connections leased and {waiting} clients waiting")]
    Exhausted { max_size: usize, waiting: usize },

    #[error("Query failed after {duration_ms}ms ({param_count} params): {source} [query: {query}]")]
    Query {
        #[source]
        source: sqlx::Error,
        /// Leading characters of the statement text
        query: String,
        duration_ms: u64,
        param_count: usize,
    },

    #[error("Connection pool is closed")]
    Closed,

    #[error("Failed to open database connection: {0}")]
    Connect(#[source] sqlx::Error),
}

impl PoolError {
    /// The driver error behind this failure, if any.
    pub fn driver_error(&self) -> Option<&sqlx::Error> {
        match self {
            PoolError::Query { source, .. } => Some(source),
            PoolError::Connect(source) => Some(source),
            _ => None,
        }
    }

    /// Whether the failure means the database could not be reached, as
    /// opposed to a statement being rejected.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, PoolError::Query { .. })
    }
}

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub slow_query_threshold: Duration,
    pub max_waiting_clients: Option<usize>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 20,
            idle_timeout: Duration::from_millis(30_000),
            connect_timeout: Duration::from_millis(2_000),
            slow_query_threshold: Duration::from_millis(1_000),
            max_waiting_clients: None,
        }
    }
}

pub(crate) struct IdleConnection<T> {
    conn: T,
    idle_since: Instant,
}

pub(crate) struct PoolInner<C: Connector> {
    connector: C,
    options: PoolOptions,
    /// One permit per lease slot
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection<C::Connection>>>,
    /// Connections currently out on lease, reachable for forced termination
    leases: Mutex<HashMap<Uuid, Arc<LeaseSlot<C::Connection>>>>,
    state: AtomicU8,
    total: AtomicUsize,
    /// Slots in use, counted from permit to release
    leased: AtomicUsize,
    waiting: AtomicUsize,
    errors: AtomicU64,
    /// Signalled whenever a lease is returned
    returned: Notify,
}

impl<C: Connector> PoolInner<C> {
    pub(crate) fn state(&self) -> PoolState {
        PoolState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn slow_query_threshold(&self) -> Duration {
        self.options.slow_query_threshold
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::AcqRel);
    }

    fn ensure_ready(&self) -> Result<(), PoolError> {
        match self.state() {
            PoolState::Ready => Ok(()),
            PoolState::Draining | PoolState::Closed => Err(PoolError::Closed),
        }
    }

    /// Take the most recently returned idle connection, or close the whole
    /// stack if that connection has sat idle past `idle_timeout`.
    async fn take_idle(&self) -> Option<C::Connection> {
        let expired: Vec<_> = {
            let mut idle = self.idle.lock();
            let top_expired = match idle.last() {
                Some(top) => top.idle_since.elapsed() >= self.options.idle_timeout,
                None => return None,
            };
            if !top_expired {
                return idle.pop().map(|entry| entry.conn);
            }
            // Entries are pushed in return order, so everything below an
            // expired top has expired too.
            idle.drain(..).map(|entry| entry.conn).collect()
        };

        self.close_all(expired, "idle timeout").await;
        None
    }

    /// End a lease: return its connection, if it still has one, and free
    /// the slot. Never blocks beyond the idle-stack and registry locks.
    pub(crate) fn finish_lease(&self, id: Uuid, slot: &LeaseSlot<C::Connection>) {
        self.leases.lock().remove(&id);

        if let Some(conn) = slot.take() {
            if slot.is_broken() || self.state() != PoolState::Ready {
                self.discard_connection(conn);
            } else {
                self.idle.lock().push(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
            }
        }

        self.release_slot();
    }

    fn release_slot(&self) {
        self.leased.fetch_sub(1, Ordering::AcqRel);
        self.returned.notify_waiters();
    }

    /// Drop a connection from the pool from a synchronous context.
    pub(crate) fn discard_connection(&self, conn: C::Connection) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        close_detached(conn);
    }

    pub(crate) async fn close_connection(&self, conn: C::Connection, reason: &'static str) {
        self.close_all(vec![conn], reason).await;
    }

    async fn close_all(&self, conns: Vec<C::Connection>, reason: &'static str) {
        if conns.is_empty() {
            return;
        }

        self.total.fetch_sub(conns.len(), Ordering::AcqRel);
        tracing::debug!(count = conns.len(), reason, "Closing database connections");

        for conn in conns {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "Error while closing database connection");
            }
        }
    }

    fn snapshot(&self) -> PoolMetrics {
        let idle_connections = self.idle.lock().len();
        PoolMetrics {
            total_connections: self.total.load(Ordering::Acquire),
            idle_connections,
            waiting_clients: self.waiting.load(Ordering::Acquire),
            errors: self.errors.load(Ordering::Acquire),
        }
    }
}

/// Close a connection from a synchronous context.
///
/// Without a runtime (process teardown) the connection is simply dropped.
fn close_detached<T: DatabaseConnection>(conn: T) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "Error while closing database connection");
            }
        });
    }
}

/// Frees a claimed slot unless the acquire completes, including when the
/// acquiring future is dropped mid-connect.
struct PendingLease<'a, C: Connector> {
    inner: &'a PoolInner<C>,
    completed: bool,
}

impl<C: Connector> Drop for PendingLease<'_, C> {
    fn drop(&mut self) {
        if !self.completed {
            self.inner.release_slot();
        }
    }
}

/// Decrements the waiting counter when an acquire stops waiting, including
/// when the acquiring future is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared handle to a bounded connection pool.
///
/// Cloning is cheap; every clone refers to the same pool.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a pool in the `Ready` state. No connection is opened until
    /// the first acquisition.
    pub fn new(connector: C, options: PoolOptions) -> Self {
        let max_size = options.max_size.max(1);
        let options = PoolOptions { max_size, ..options };

        tracing::info!(
            endpoint = %connector.endpoint(),
            max_size,
            idle_timeout_ms = options.idle_timeout.as_millis() as u64,
            connect_timeout_ms = options.connect_timeout.as_millis() as u64,
            "PostgreSQL connection pool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                connector,
                slots: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(Vec::with_capacity(max_size)),
                leases: Mutex::new(HashMap::with_capacity(max_size)),
                options,
                state: AtomicU8::new(PoolState::Ready as u8),
                total: AtomicUsize::new(0),
                leased: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                errors: AtomicU64::new(0),
                returned: Notify::new(),
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    /// Endpoint description safe for logs.
    pub fn endpoint(&self) -> String {
        self.inner.connector.endpoint()
    }

    /// Check out a connection for exclusive use.
    ///
    /// Waits at most `connect_timeout` for a free slot and the physical
    /// connect combined. Fails immediately once the pool is draining or
    /// closed.
    pub async fn acquire(&self) -> Result<ConnectionLease<C>, PoolError> {
        let inner = &self.inner;
        inner.ensure_ready()?;

        let started = Instant::now();
        let deadline = started + inner.options.connect_timeout;

        let permit = match inner.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
            Err(TryAcquireError::NoPermits) => {
                let waiting = inner.waiting.fetch_add(1, Ordering::AcqRel) + 1;
                let _guard = WaitingGuard(&inner.waiting);

                if let Some(limit) = inner.options.max_waiting_clients {
                    if waiting > limit {
                        tracing::warn!(
                            max_size = inner.options.max_size,
                            waiting = waiting - 1,
                            "Connection pool exhausted"
                        );
                        return Err(PoolError::Exhausted {
                            max_size: inner.options.max_size,
                            waiting: waiting - 1,
                        });
                    }
                }

                match tokio::time::timeout_at(deadline, inner.slots.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(PoolError::Closed),
                    Err(_) => {
                        AcquireMetrics::record_timeout();
                        return Err(PoolError::ConnectTimeout {
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                }
            }
        };

        // The pool may have started draining while this caller waited.
        inner.ensure_ready()?;

        // Counted from here so a shutdown drain waits for this connect.
        inner.leased.fetch_add(1, Ordering::AcqRel);
        let mut pending = PendingLease {
            inner: &**inner,
            completed: false,
        };

        let conn = match inner.take_idle().await {
            Some(conn) => conn,
            None => match tokio::time::timeout_at(deadline, inner.connector.connect()).await {
                Ok(Ok(conn)) => {
                    let total = inner.total.fetch_add(1, Ordering::AcqRel) + 1;
                    tracing::debug!(total_connections = total, "Opened database connection");
                    conn
                }
                Ok(Err(e)) => {
                    inner.record_error();
                    tracing::error!(error = %e, "Failed to open database connection");
                    return Err(PoolError::Connect(e));
                }
                Err(_) => {
                    inner.record_error();
                    AcquireMetrics::record_timeout();
                    return Err(PoolError::ConnectTimeout {
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            },
        };

        let id = Uuid::new_v4();
        let slot = Arc::new(LeaseSlot::new(conn));

        // Checked under the registry lock so shutdown either sees this lease
        // when terminating or this acquire sees the shutdown.
        let admitted = {
            let mut leases = inner.leases.lock();
            let ready = inner.ensure_ready().is_ok();
            if ready {
                leases.insert(id, slot.clone());
            }
            ready
        };

        if !admitted {
            if let Some(conn) = slot.take() {
                inner.close_connection(conn, "pool closed").await;
            }
            return Err(PoolError::Closed);
        }

        pending.completed = true;
        AcquireMetrics::record_wait(started.elapsed().as_secs_f64());

        Ok(ConnectionLease::new(id, slot, permit, inner.clone()))
    }

    /// Return a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, lease: ConnectionLease<C>) {
        lease.release();
    }

    /// Acquire, execute one statement, release.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryOutput, PoolError> {
        let mut lease = self.acquire().await?;
        let result = lease.query(sql, params).await;
        lease.release();
        result
    }

    /// Acquire a connection and ping it.
    async fn ping_once(&self) -> Result<(), PoolError> {
        let mut lease = self.acquire().await?;
        lease.ping().await
    }

    /// Verify connectivity with a bounded number of attempts.
    ///
    /// Makes up to `max_retries` attempts (at least one), sleeping a fixed
    /// `retry_delay` after each failed one. Returns `true` on the first
    /// success, so an unreachable database costs `max_retries * retry_delay`.
    pub async fn test_connectivity(&self, max_retries: u32, retry_delay: Duration) -> bool {
        let attempts = max_retries.max(1);

        for attempt in 1..=attempts {
            match self.ping_once().await {
                Ok(()) => {
                    tracing::info!(attempt, endpoint = %self.endpoint(), "Database connected");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Database connection attempt failed"
                    );
                }
            }

            sleep(retry_delay).await;
        }

        tracing::error!(
            attempts,
            endpoint = %self.endpoint(),
            "Database connection failed after all attempts"
        );
        false
    }

    /// Single best-effort health check. Never fails; unreachability is reported
    /// as `healthy: false`.
    pub async fn check_health(&self) -> HealthResult {
        let started = Instant::now();

        let healthy = match self.ping_once().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Database health check failed");
                false
            }
        };

        HealthResult {
            healthy,
            metrics: self.metrics(),
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    /// Fresh utilization snapshot.
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.snapshot()
    }

    /// Close idle connections that exceeded `idle_timeout`. Returns how many
    /// were closed.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.inner.options.idle_timeout;
        let expired: Vec<_> = {
            let mut idle = self.inner.idle.lock();
            let (expired, kept): (Vec<_>, Vec<_>) = mem::take(&mut *idle)
                .into_iter()
                .partition(|entry| entry.idle_since.elapsed() >= idle_timeout);
            *idle = kept;
            expired.into_iter().map(|entry| entry.conn).collect()
        };

        let count = expired.len();
        self.inner.close_all(expired, "idle timeout").await;
        count
    }

    /// Drain and close the pool.
    ///
    /// New acquisitions fail with `PoolError::Closed` from the moment this
    /// is called. Outstanding leases get up to `grace` to be returned; any
    /// still out afterwards are terminated: their queries fail with
    /// `PoolError::Closed` and their connections are closed when dropped.
    /// Calling this more than once is a no-op.
    #[tracing::instrument(name = "pool_shutdown", skip(self), fields(grace_ms = grace.as_millis() as u64))]
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let inner = &self.inner;
        let started = Instant::now();
        let mut report = ShutdownReport::default();

        if inner
            .state
            .compare_exchange(
                PoolState::Ready as u8,
                PoolState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::debug!(state = self.state().as_str(), "Connection pool already shut down");
            return report;
        }

        // Wake queued acquirers so they fail fast.
        inner.slots.close();

        let idle: Vec<_> = mem::take(&mut *inner.idle.lock())
            .into_iter()
            .map(|entry| entry.conn)
            .collect();
        report.closed_idle = idle.len();
        inner.close_all(idle, "shutdown").await;

        let outstanding = inner.leased.load(Ordering::Acquire);
        tracing::info!(
            closed_idle = report.closed_idle,
            outstanding_leases = outstanding,
            "Connection pool draining"
        );

        let drain = async {
            loop {
                let returned = inner.returned.notified();
                if inner.leased.load(Ordering::Acquire) == 0 {
                    break;
                }
                returned.await;
            }
        };
        let _ = timeout(grace, drain).await;

        inner.state.store(PoolState::Closed as u8, Ordering::Release);

        let remaining = inner.leased.load(Ordering::Acquire);
        report.forced_leases = remaining;
        report.drained_leases = outstanding.saturating_sub(remaining);

        if remaining > 0 {
            tracing::warn!(
                forced_leases = remaining,
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed, terminating outstanding connections"
            );

            // Connections held by a running statement are closed by that
            // statement once it observes the termination.
            let slots: Vec<_> = inner.leases.lock().values().cloned().collect();
            let resting: Vec<_> = slots.iter().filter_map(|slot| slot.terminate()).collect();
            inner.close_all(resting, "forced termination").await;
        }

        report.duration = started.elapsed();

        tracing::info!(
            drained_leases = report.drained_leases,
            duration_ms = report.duration.as_millis() as u64,
            "Database pool closed"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct StubConnection;

    #[async_trait]
    impl DatabaseConnection for StubConnection {
        async fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<QueryOutput, sqlx::Error> {
            Ok(QueryOutput::default())
        }

        async fn close(self) -> Result<(), sqlx::Error> {
            Ok(())
        }
    }

    struct StubConnector {
        reachable: AtomicBool,
    }

    #[async_trait]
    impl Connector for StubConnector {
        type Connection = StubConnection;

        async fn connect(&self) -> Result<StubConnection, sqlx::Error> {
            if self.reachable.load(Ordering::Acquire) {
                Ok(StubConnection)
            } else {
                Err(sqlx::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )))
            }
        }

        fn endpoint(&self) -> String {
            "stub://db".to_string()
        }
    }

    fn pool(reachable: bool, max_size: usize) -> ConnectionPool<StubConnector> {
        ConnectionPool::new(
            StubConnector {
                reachable: AtomicBool::new(reachable),
            },
            PoolOptions {
                max_size,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_error_display() {
        let err = PoolError::Closed;
        assert_eq!(err.to_string(), "Connection pool is closed");

        let err = PoolError::ConnectTimeout { waited_ms: 2000 };
        assert!(err.to_string().contains("2000ms"));

        let err = PoolError::Exhausted {
            max_size: 2,
            waiting: 4,
        };
        assert!(err.to_string().contains("2 connections leased"));
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_zero_max_size_is_clamped() {
        let pool = pool(true, 0);
        assert_eq!(pool.options().max_size, 1);
        assert_eq!(pool.state(), PoolState::Ready);
    }

    #[tokio::test]
    async fn test_acquire_counts_connection() {
        let pool = pool(true, 2);
        let lease = pool.acquire().await.unwrap();

        let metrics = pool.metrics();
        assert_eq!(metrics.total_connections, 1);
        assert_eq!(metrics.idle_connections, 0);

        pool.release(lease);
        let metrics = pool.metrics();
        assert_eq!(metrics.total_connections, 1);
        assert_eq!(metrics.idle_connections, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_counts_error() {
        let pool = pool(false, 2);
        let err = pool.acquire().await.unwrap_err();

        assert!(matches!(err, PoolError::Connect(_)));
        assert!(err.driver_error().is_some());
        assert_eq!(pool.metrics().errors, 1);
        assert_eq!(pool.metrics().total_connections, 0);
    }

    #[tokio::test]
    async fn test_shutdown_twice_is_noop() {
        let pool = pool(true, 2);
        pool.query("SELECT 1", &[]).await.unwrap();

        let first = pool.shutdown(Duration::from_millis(50)).await;
        assert_eq!(first.closed_idle, 1);
        assert_eq!(pool.state(), PoolState::Closed);

        let second = pool.shutdown(Duration::from_millis(50)).await;
        assert_eq!(second.closed_idle, 0);
        assert!(!second.was_forced());
    }
}
