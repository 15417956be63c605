//! Bounded connection pool
//!
//! Connections are opened lazily up to `max_connections` and reused across
//! requests. Each borrowed connection holds one semaphore permit, so callers
//! beyond the limit wait (up to `acquire_timeout`) for a release. The idle
//! list and the counters live behind a plain mutex that is never held across
//! an `.await`.
//!
//! A borrowed connection is handed out as a [`PooledConnection`]. Releasing it
//! puts it back on the idle list; dropping it without a release (including
//! when the task running a query is cancelled) closes it instead, since its
//! session state is unknown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::{
    config::GatewayConfig,
    db::{Connection, Connector, QueryResult, Value},
    error::{GatewayError, GatewayResult},
};

/// Lifecycle of the pool as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Open,
    /// Shutdown requested, borrowed connections still outstanding
    Closing,
    Closed,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub borrowed: usize,
    pub max_connections: usize,
    pub status: PoolStatus,
    pub connections_created: u64,
    pub connections_discarded: u64,
}

#[derive(Debug, Clone)]
struct PoolOptions {
    max_connections: usize,
    idle_timeout: Duration,
    acquire_timeout: Duration,
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    idle_since: Instant,
}

/// Everything guarded by the pool mutex
struct PoolState {
    idle: Vec<IdleConnection>,
    /// Idle + borrowed + being established
    live: usize,
    borrowed: usize,
    status: PoolStatus,
}

struct Shared {
    options: PoolOptions,
    connector: Arc<dyn Connector>,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    status_tx: watch::Sender<PoolStatus>,
    created: AtomicU64,
    discarded: AtomicU64,
}

/// Shared handle to the connection pool
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    /// Create an empty pool. No connection is opened until the first acquire.
    ///
    /// When called inside a tokio runtime, a background task closes
    /// connections that sit idle longer than `idle_timeout`.
    pub fn new(config: &GatewayConfig, connector: Arc<dyn Connector>) -> Self {
        let options = PoolOptions {
            max_connections: config.max_connections,
            idle_timeout: config.idle_timeout,
            acquire_timeout: config.acquire_timeout,
        };
        let (status_tx, _) = watch::channel(PoolStatus::Open);

        let shared = Arc::new(Shared {
            semaphore: Arc::new(Semaphore::new(options.max_connections)),
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(options.max_connections),
                live: 0,
                borrowed: 0,
                status: PoolStatus::Open,
            }),
            options,
            connector,
            status_tx,
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        });

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let period = (shared.options.idle_timeout / 2).max(Duration::from_millis(10));
            runtime.spawn(reap_idle(Arc::downgrade(&shared), period));
        }

        Self { shared }
    }

    /// Borrow a connection
    ///
    /// Reuses the most recently released idle connection, opens a new one if
    /// the pool is below its limit, or waits for a release. Cancelling the
    /// returned future while it waits has no effect on the pool.
    pub async fn acquire(&self) -> GatewayResult<PooledConnection> {
        let shared = &self.shared;
        if shared.status() != PoolStatus::Open {
            return Err(GatewayError::PoolClosed);
        }

        let started = Instant::now();
        let timeout = shared.options.acquire_timeout;
        let permit = match tokio::time::timeout(timeout, shared.semaphore.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            // The semaphore is closed on shutdown
            Ok(Err(_)) => return Err(GatewayError::PoolClosed),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    max_connections = shared.options.max_connections,
                    "Timed out waiting for a database connection"
                );
                return Err(GatewayError::AcquireTimeout(timeout));
            }
        };

        let (reused, expired) = {
            let mut state = shared.lock();
            if state.status != PoolStatus::Open {
                return Err(GatewayError::PoolClosed);
            }

            let mut expired = Vec::new();
            let mut reused = None;
            while let Some(entry) = state.idle.pop() {
                if entry.idle_since.elapsed() >= shared.options.idle_timeout {
                    expired.push(entry.conn);
                } else {
                    reused = Some(entry.conn);
                    break;
                }
            }
            shared.retire(&mut state, expired.len());

            // Count the new connection before it exists so the limit holds
            // while it is being established.
            state.live += usize::from(reused.is_none());
            state.borrowed += 1;
            (reused, expired)
        };

        let handle = |conn: Box<dyn Connection>| PooledConnection {
            conn: Some(conn),
            shared: shared.clone(),
            in_flight: false,
            broken: false,
            _permit: permit,
        };

        let conn = match reused {
            Some(conn) => {
                let conn = handle(conn);
                close_all(expired).await;
                conn
            }
            None => {
                let reservation = SlotReservation {
                    shared: shared.clone(),
                    armed: true,
                };
                close_all(expired).await;

                let conn = match shared.connector.connect().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            driver = shared.connector.name(),
                            "Failed to open database connection"
                        );
                        return Err(e);
                    }
                };
                reservation.disarm();
                let created = shared.created.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(created, "Opened database connection");
                handle(conn)
            }
        };

        tracing::trace!(
            wait_ms = started.elapsed().as_millis() as u64,
            "Borrowed database connection"
        );

        Ok(conn)
    }

    /// Stop handing out connections
    ///
    /// Closes idle connections immediately and wakes every waiting caller
    /// with `PoolClosed`. Borrowed connections are closed as they come back.
    /// Calling this more than once is a no-op.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let (drained, outstanding) = {
            let mut state = shared.lock();
            if state.status != PoolStatus::Open {
                return;
            }
            shared.set_status(&mut state, PoolStatus::Closing);

            let drained: Vec<_> = state.idle.drain(..).map(|entry| entry.conn).collect();
            shared.retire(&mut state, drained.len());
            // Nothing may come back to trigger the transition
            shared.finish_closing(&mut state);
            (drained, state.borrowed)
        };
        shared.semaphore.close();

        tracing::info!(
            closing = drained.len(),
            outstanding,
            "Shutting down connection pool"
        );
        close_all(drained).await;
    }

    /// Resolves once shutdown has completed and every connection is closed
    pub async fn closed(&self) {
        let mut rx = self.shared.status_tx.subscribe();
        // The sender lives in `shared`, which `self` keeps alive
        let _ = rx.wait_for(|status| *status == PoolStatus::Closed).await;
    }

    pub fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            borrowed: state.borrowed,
            max_connections: self.shared.options.max_connections,
            status: state.status,
            connections_created: self.shared.created.load(Ordering::Relaxed),
            connections_discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // State is only mutated by short, non-panicking sections
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> PoolStatus {
        self.lock().status
    }

    fn set_status(&self, state: &mut PoolState, status: PoolStatus) {
        state.status = status;
        self.status_tx.send_replace(status);
    }

    /// Account for `count` connections leaving the pool for good
    fn retire(&self, state: &mut PoolState, count: usize) {
        if count == 0 {
            return;
        }
        state.live -= count;
        self.discarded.fetch_add(count as u64, Ordering::Relaxed);
        self.finish_closing(state);
    }

    /// closing -> closed once the last live connection is gone
    fn finish_closing(&self, state: &mut PoolState) {
        if state.status == PoolStatus::Closing && state.live == 0 {
            self.set_status(state, PoolStatus::Closed);
            tracing::info!("Connection pool closed");
        }
    }

    /// Take back a borrowed connection. Returns it when it must be closed.
    fn check_in(
        &self,
        conn: Box<dyn Connection>,
        reusable: bool,
    ) -> Option<Box<dyn Connection>> {
        let mut state = self.lock();
        state.borrowed -= 1;

        if reusable && state.status == PoolStatus::Open {
            state.idle.push(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
            None
        } else {
            self.retire(&mut state, 1);
            Some(conn)
        }
    }

    fn take_expired(&self) -> Vec<Box<dyn Connection>> {
        let mut state = self.lock();
        let idle_timeout = self.options.idle_timeout;

        let (expired, keep): (Vec<_>, Vec<_>) = state
            .idle
            .drain(..)
            .partition(|entry| entry.idle_since.elapsed() >= idle_timeout);
        state.idle = keep;
        self.retire(&mut state, expired.len());

        expired.into_iter().map(|entry| entry.conn).collect()
    }
}

/// Releases a slot counted for a connection that never got established
struct SlotReservation {
    shared: Arc<Shared>,
    armed: bool,
}

impl SlotReservation {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            state.borrowed -= 1;
            state.live -= 1;
            self.shared.finish_closing(&mut state);
        }
    }
}

/// A connection borrowed from the pool
///
/// Statements issued through one handle run one at a time, in order. Give
/// the connection back with [`PooledConnection::release`]; a handle that is
/// simply dropped closes its connection and frees the slot.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    shared: Arc<Shared>,
    /// Stays set if a statement future is dropped before completing
    in_flight: bool,
    /// Set on the first transport failure
    broken: bool,
    // Dropped after `Drop::drop` has updated the pool state
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("in_flight", &self.in_flight)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn conn(&mut self) -> GatewayResult<&mut Box<dyn Connection>> {
        self.conn
            .as_mut()
            .ok_or_else(|| GatewayError::Transport("connection already released".to_string()))
    }

    fn record(&mut self, result: &GatewayResult<impl Sized>) {
        self.in_flight = false;
        if matches!(result, Err(e) if e.is_transport()) {
            self.broken = true;
        }
    }

    /// Run one statement on this connection
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> GatewayResult<QueryResult> {
        self.in_flight = true;
        let result = self.conn()?.execute(sql, params).await;
        self.record(&result);
        result
    }

    /// Check the connection is still alive
    pub async fn ping(&mut self) -> GatewayResult<()> {
        self.in_flight = true;
        let result = self.conn()?.ping().await;
        self.record(&result);
        result
    }

    /// Whether a transport failure or an interrupted statement has made
    /// this connection unusable
    pub fn is_broken(&self) -> bool {
        self.broken || self.in_flight
    }

    /// Return the connection to the pool
    ///
    /// Broken connections, and any connection released after shutdown, are
    /// closed instead.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            let reusable = !self.is_broken();
            if let Some(conn) = self.shared.check_in(conn, reusable) {
                if !reusable {
                    tracing::warn!("Discarding broken database connection");
                }
                close_all(vec![conn]).await;
            }
        }
    }

    /// Close the connection instead of returning it to the pool
    pub async fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(conn) = self.shared.check_in(conn, false) {
                close_all(vec![conn]).await;
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!(
                in_flight = self.in_flight,
                "Connection dropped without release, discarding"
            );
            if let Some(mut conn) = self.shared.check_in(conn, false) {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    runtime.spawn(async move {
                        let _ = conn.close().await;
                    });
                }
            }
        }
    }
}

async fn close_all(conns: Vec<Box<dyn Connection>>) {
    for mut conn in conns {
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "Error while closing database connection");
        }
    }
}

/// Background task closing connections idle for longer than `idle_timeout`
///
/// Holds only a weak reference, so it ends when the pool is dropped.
async fn reap_idle(shared: Weak<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let expired = {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if shared.status() != PoolStatus::Open {
                break;
            }
            shared.take_expired()
        };

        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Closing idle database connections");
            close_all(expired).await;
        }
    }
}
