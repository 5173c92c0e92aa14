//! Exclusive lease on one pooled connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, OwnedSemaphorePermit};
use tokio::time::Instant;
use uuid::Uuid;

use crate::metrics::QueryMetrics;

use super::connector::{Connector, DatabaseConnection, PING_QUERY};
use super::pool::{PoolError, PoolInner};
use super::types::{PoolState, QueryOutput};

/// Maximum number of statement characters carried in errors and logs.
pub const QUERY_PREVIEW_CHARS: usize = 100;

/// Holder of a leased connection that the pool can reach.
///
/// Statements take the connection out for their duration and put it back
/// afterwards. Once terminated, the slot refuses the connection and wakes
/// any statement in flight.
pub(crate) struct LeaseSlot<T> {
    conn: Mutex<Option<T>>,
    terminated: AtomicBool,
    broken: AtomicBool,
    on_terminate: Notify,
}

impl<T> LeaseSlot<T> {
    pub(crate) fn new(conn: T) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            terminated: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            on_terminate: Notify::new(),
        }
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.conn.lock().take()
    }

    /// Put a connection back. Hands it back to the caller when the slot has
    /// been terminated in the meantime.
    fn put(&self, conn: T) -> Result<(), T> {
        let mut slot = self.conn.lock();
        if self.terminated.load(Ordering::Acquire) {
            return Err(conn);
        }
        *slot = Some(conn);
        Ok(())
    }

    /// Mark the lease terminated, returning the connection if no statement
    /// currently holds it.
    pub(crate) fn terminate(&self) -> Option<T> {
        let conn = {
            let mut slot = self.conn.lock();
            self.terminated.store(true, Ordering::Release);
            slot.take()
        };
        self.on_terminate.notify_waiters();
        conn
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }
}

/// Connection taken out of a slot for one statement. Puts it back when
/// dropped, so a cancelled statement does not lose the connection.
struct Checkout<'a, C: Connector> {
    conn: Option<C::Connection>,
    slot: &'a LeaseSlot<C::Connection>,
    pool: &'a PoolInner<C>,
    in_flight: bool,
}

impl<C: Connector> Checkout<'_, C> {
    fn into_inner(mut self) -> Option<C::Connection> {
        self.conn.take()
    }
}

impl<C: Connector> Drop for Checkout<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Protocol state is unknown after a cancelled statement
            if self.in_flight {
                self.slot.mark_broken();
            }
            if let Err(conn) = self.slot.put(conn) {
                self.pool.discard_connection(conn);
            }
        }
    }
}

enum Statement<'a> {
    Execute(&'a str, &'a [Value]),
    Ping,
}

/// A connection checked out of the pool.
///
/// The connection goes back to the pool when the lease is released or
/// dropped, whichever comes first, so every exit path returns it. If the
/// pool shuts down with the lease still held, the connection is closed
/// from under it and further statements fail with `PoolError::Closed`.
pub struct ConnectionLease<C: Connector> {
    id: Uuid,
    slot: Arc<LeaseSlot<C::Connection>>,
    pool: Arc<PoolInner<C>>,
    acquired_at: Instant,
    // Dropped after `Drop::drop` has returned the connection, so a waiter
    // woken by this permit finds the connection on the idle stack.
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> ConnectionLease<C> {
    pub(crate) fn new(
        id: Uuid,
        slot: Arc<LeaseSlot<C::Connection>>,
        permit: OwnedSemaphorePermit,
        pool: Arc<PoolInner<C>>,
    ) -> Self {
        Self {
            id,
            slot,
            pool,
            acquired_at: Instant::now(),
            _permit: permit,
        }
    }

    /// How long this lease has been held.
    pub fn held_for(&self) -> std::time::Duration {
        self.acquired_at.elapsed()
    }

    /// Run one statement on the leased connection, abandoning it if the
    /// pool terminates the lease meanwhile.
    async fn run(
        &mut self,
        statement: Statement<'_>,
    ) -> Result<Result<QueryOutput, sqlx::Error>, PoolError> {
        let slot = &*self.slot;
        // Registered before the connection is taken so a termination in
        // between is not missed.
        let terminated = slot.on_terminate.notified();

        if self.pool.state() == PoolState::Closed {
            return Err(PoolError::Closed);
        }

        let conn = slot.take().ok_or(PoolError::Closed)?;
        let mut checkout = Checkout {
            conn: Some(conn),
            slot,
            pool: &*self.pool,
            in_flight: true,
        };

        let outcome = {
            let Some(conn) = checkout.conn.as_mut() else {
                return Err(PoolError::Closed);
            };
            tokio::select! {
                result = async move {
                    match statement {
                        Statement::Execute(sql, params) => conn.execute(sql, params).await,
                        Statement::Ping => conn.ping().await.map(|_| QueryOutput::default()),
                    }
                } => Some(result),
                _ = terminated => None,
            }
        };
        checkout.in_flight = false;

        match outcome {
            Some(result) => Ok(result),
            None => {
                if let Some(conn) = checkout.into_inner() {
                    self.pool.close_connection(conn, "terminated").await;
                }
                tracing::warn!(lease_id = %self.id, "Statement aborted by pool shutdown");
                Err(PoolError::Closed)
            }
        }
    }

    /// Execute one statement on the leased connection.
    ///
    /// Parameter values never appear in errors or logs; only their count.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutput, PoolError> {
        let slow_threshold = self.pool.slow_query_threshold();

        let started = Instant::now();
        let result = self.run(Statement::Execute(sql, params)).await?;
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;

        match result {
            Ok(output) => {
                QueryMetrics::record_success(duration.as_secs_f64());
                if duration > slow_threshold {
                    QueryMetrics::record_slow();
                    tracing::warn!(
                        lease_id = %self.id,
                        query = %query_preview(sql),
                        duration_ms,
                        rows = output.row_count,
                        threshold_ms = slow_threshold.as_millis() as u64,
                        "Slow query"
                    );
                } else {
                    tracing::debug!(
                        lease_id = %self.id,
                        query = %query_preview(sql),
                        duration_ms,
                        rows = output.row_count,
                        "Executed query"
                    );
                }
                Ok(output)
            }
            Err(source) => {
                QueryMetrics::record_failure(duration.as_secs_f64());
                if is_connection_error(&source) {
                    self.slot.mark_broken();
                    self.pool.record_error();
                }

                let query = query_preview(sql);
                tracing::error!(
                    lease_id = %self.id,
                    query = %query,
                    duration_ms,
                    param_count = params.len(),
                    error = %source,
                    "Query error"
                );

                Err(PoolError::Query {
                    source,
                    query,
                    duration_ms,
                    param_count: params.len(),
                })
            }
        }
    }

    /// Run several statements in order, stopping at the first failure.
    ///
    /// Used for passthrough transactional sequences such as
    /// `BEGIN; ...; COMMIT`.
    pub async fn execute_batch(&mut self, statements: &[&str]) -> Result<(), PoolError> {
        for statement in statements {
            self.query(statement, &[]).await?;
        }
        Ok(())
    }

    /// Ping the connection. A failed ping discards it.
    pub async fn ping(&mut self) -> Result<(), PoolError> {
        let started = Instant::now();

        match self.run(Statement::Ping).await? {
            Ok(_) => Ok(()),
            Err(source) => {
                self.slot.mark_broken();
                self.pool.record_error();
                Err(PoolError::Query {
                    source,
                    query: PING_QUERY.to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    param_count: 0,
                })
            }
        }
    }

    /// Give the connection back to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Close the connection instead of returning it to the pool.
    pub fn discard(self) {
        self.slot.mark_broken();
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionLease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("id", &self.id)
            .field("held_for", &self.held_for())
            .field("broken", &self.slot.is_broken())
            .finish()
    }
}

impl<C: Connector> Drop for ConnectionLease<C> {
    fn drop(&mut self) {
        tracing::trace!(
            lease_id = %self.id,
            held_ms = self.held_for().as_millis() as u64,
            broken = self.slot.is_broken(),
            "Releasing connection"
        );
        self.pool.finish_lease(self.id, &self.slot);
    }
}

/// Leading characters of a statement, cut on a character boundary.
pub fn query_preview(sql: &str) -> String {
    sql.trim().chars().take(QUERY_PREVIEW_CHARS).collect()
}

/// Errors after which the connection cannot be trusted for reuse.
fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
    )
}
