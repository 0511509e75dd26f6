//! Connection pool manager.
//!
//! All bookkeeping (connection map, idle stack, waiter queue, counters) lives
//! in one [`PoolState`] behind a `tokio::sync::Mutex`. Anything that may
//! block (opening a connection, pinging it, passing bytes through it) runs
//! on the blocking thread pool with the state lock released.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use dbkeeper_core::{PoolConfig, as_millis_f64};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PoolError;

/// Trait abstracting the underlying transport for testability.
///
/// The pool never interprets the bytes passed through a backend; the
/// statement protocol belongs to the driver on the other side.
pub trait ConnectionBackend: Send + std::fmt::Debug {
    /// Send bytes over the connection. Returns bytes sent.
    fn send(&mut self, data: &[u8]) -> Result<usize, String>;
    /// Receive up to `max_bytes` from the connection.
    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, String>;
    /// Liveness check. Returns `true` if the connection is usable.
    fn ping(&mut self) -> bool;
    /// Close the underlying transport.
    fn close(&mut self);
}

/// Factory for creating new connections. Injected for testability.
pub trait ConnectionFactory: Send + Sync {
    /// Establish a new connection to the database.
    fn connect(&self) -> Result<Box<dyn ConnectionBackend>, String>;
}

/// Opaque reference to one pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Busy,
    /// Checked out and flagged as broken; destroyed on release.
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Idle => write!(f, "idle"),
            ConnectionStatus::Busy => write!(f, "busy"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub status: ConnectionStatus,
    pub created_at: Instant,
    pub last_used: Instant,
    pub query_count: u64,
}

/// Pool-level statistics.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PoolStats {
    /// Connections currently open (idle + busy).
    pub total: usize,
    pub idle: usize,
    /// Connections checked out, including ones flagged broken.
    pub busy: usize,
    /// Acquire calls queued for a connection.
    pub waiting: usize,
    /// Configured `max_connections`.
    pub max: usize,
    pub total_queries: u64,
    /// Mean of all recorded execution times, in milliseconds.
    pub avg_query_time_ms: f64,
    /// Acquire calls that had to queue.
    pub wait_count: u64,
    /// Queued acquire calls that timed out.
    pub timeouts: u64,
    pub created: u64,
    pub destroyed: u64,
}

impl PoolStats {
    /// Busy connections as a fraction of open connections (0.0 when empty).
    pub fn busy_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.busy as f64 / self.total as f64
    }

    /// Busy connections as a percentage of open connections.
    pub fn utilization(&self) -> f64 {
        self.busy_ratio() * 100.0
    }

    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

type SharedBackend = Arc<std::sync::Mutex<Box<dyn ConnectionBackend>>>;

fn close_backend(backend: &SharedBackend) {
    backend
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .close();
}

/// A pooled connection with tracking metadata.
#[derive(Debug)]
struct PooledConnection {
    id: u64,
    status: ConnectionStatus,
    created_at: Instant,
    last_used: Instant,
    query_count: u64,
    backend: SharedBackend,
}

impl PooledConnection {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            status: self.status,
            created_at: self.created_at,
            last_used: self.last_used,
            query_count: self.query_count,
        }
    }
}

type HandoffResult = Result<ConnectionHandle, PoolError>;

/// A queued acquire call.
#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<HandoffResult>,
    enqueued_at: Instant,
}

/// Receiving side of a connection hand-off.
///
/// If the acquiring future is dropped before it reads the result, a
/// connection already sent into the channel goes back to the pool and a
/// still-queued waiter is unlinked.
struct Handoff {
    pool: ConnectionPool,
    waiter_id: Option<u64>,
    rx: oneshot::Receiver<HandoffResult>,
    settled: bool,
}

impl Handoff {
    fn new(
        pool: ConnectionPool,
        waiter_id: Option<u64>,
        rx: oneshot::Receiver<HandoffResult>,
    ) -> Self {
        Self {
            pool,
            waiter_id,
            rx,
            settled: false,
        }
    }

    fn settle(&mut self, result: HandoffResult) -> HandoffResult {
        self.settled = true;
        result
    }
}

impl Drop for Handoff {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Closing first means a sender that has not fired yet sees the
        // failure and routes the connection elsewhere itself.
        self.rx.close();
        let delivered = match self.rx.try_recv() {
            Ok(Ok(handle)) => Some(handle),
            _ => None,
        };
        if delivered.is_none() && self.waiter_id.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = self.pool.clone();
        let waiter_id = self.waiter_id;
        runtime.spawn(async move {
            if let Some(waiter_id) = waiter_id {
                pool.inner.state.lock().await.unlink_waiter(waiter_id);
            }
            if let Some(handle) = delivered {
                debug!(%handle, "returning connection from abandoned acquire");
                if let Err(e) = pool.release(handle).await {
                    debug!(%handle, error = %e, "abandoned connection not returned");
                }
            }
        });
    }
}

#[derive(Debug, Default)]
struct PoolState {
    connections: HashMap<u64, PooledConnection>,
    /// Idle connection IDs; the most recently returned one is last.
    idle: Vec<u64>,
    waiters: VecDeque<Waiter>,
    /// Connections being opened outside the lock; counted against the cap.
    pending: usize,
    next_connection_id: u64,
    next_waiter_id: u64,
    initialized: bool,
    closed: bool,
    total_queries: u64,
    total_query_time: Duration,
    wait_count: u64,
    timeouts: u64,
    created: u64,
    destroyed: u64,
}

impl PoolState {
    fn open_slots(&self, limit: usize) -> bool {
        self.connections.len() + self.pending < limit
    }

    fn insert(&mut self, backend: SharedBackend) -> u64 {
        self.next_connection_id += 1;
        let id = self.next_connection_id;
        let now = Instant::now();
        self.connections.insert(
            id,
            PooledConnection {
                id,
                status: ConnectionStatus::Busy,
                created_at: now,
                last_used: now,
                query_count: 0,
                backend,
            },
        );
        self.created += 1;
        id
    }

    /// Pop the most recently used idle connection and mark it busy.
    fn take_idle(&mut self) -> Option<u64> {
        while let Some(id) = self.idle.pop() {
            if let Some(conn) = self.connections.get_mut(&id) {
                if conn.status == ConnectionStatus::Idle {
                    conn.status = ConnectionStatus::Busy;
                    conn.last_used = Instant::now();
                    return Some(id);
                }
            }
        }
        None
    }

    /// Hand an available connection to the oldest live waiter, or park it idle.
    ///
    /// Runs under the pool lock, so a waiter popped here can never also be
    /// removed by its own timeout path.
    fn dispatch(&mut self, id: u64) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.last_used = Instant::now();
        while let Some(waiter) = self.waiters.pop_front() {
            conn.status = ConnectionStatus::Busy;
            match waiter.tx.send(Ok(ConnectionHandle(id))) {
                Ok(()) => {
                    debug!(
                        handle = id,
                        waiter = waiter.id,
                        waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64,
                        "handed connection to waiter"
                    );
                    return;
                }
                // The acquiring future was dropped; try the next one.
                Err(_) => continue,
            }
        }
        conn.status = ConnectionStatus::Idle;
        self.idle.push(id);
    }

    /// Drop a queued waiter. Returns `false` if it was already resolved.
    fn unlink_waiter(&mut self, waiter_id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == waiter_id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: u64) -> Option<PooledConnection> {
        self.idle.retain(|idle| *idle != id);
        let conn = self.connections.remove(&id)?;
        self.destroyed += 1;
        Some(conn)
    }

    fn checked_out(&self, id: u64) -> Result<&PooledConnection, PoolError> {
        let conn = self
            .connections
            .get(&id)
            .ok_or(PoolError::InvalidHandle(id))?;
        if conn.status == ConnectionStatus::Idle {
            return Err(PoolError::NotBusy(id));
        }
        Ok(conn)
    }
}

/// Background sweep task and its shutdown signal.
struct SweepTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    sweeper: Mutex<Option<SweepTask>>,
}

/// Bounded pool of database connections.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool. No connection is opened until [`initialize`](Self::initialize)
    /// or the first [`acquire`](Self::acquire).
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(PoolState::default()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Open `min_connections` idle connections and start the periodic sweep.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(PoolError::Closed);
            }
            if state.initialized {
                return Err(PoolError::AlreadyInitialized);
            }
            state.initialized = true;
        }

        for _ in 0..self.inner.config.min_connections {
            if !self.reserve_slot(self.inner.config.min_connections).await {
                break;
            }
            self.open_into_pool().await?;
        }

        let task = self.start_sweeper();
        *self.inner.sweeper.lock().await = Some(task);

        info!(
            min = self.inner.config.min_connections,
            max = self.inner.config.max_connections,
            sweep_interval = ?self.inner.config.health_check_interval(),
            "connection pool initialized"
        );
        Ok(())
    }

    /// Check out a connection, waiting up to `acquire_timeout` when saturated.
    pub async fn acquire(&self) -> Result<ConnectionHandle, PoolError> {
        self.acquire_timeout(self.inner.config.acquire_timeout())
            .await
    }

    /// Check out a connection, waiting at most `wait` when saturated.
    pub async fn acquire_timeout(&self, wait: Duration) -> Result<ConnectionHandle, PoolError> {
        let queued = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(id) = state.take_idle() {
                debug!(handle = id, "reused idle connection");
                return Ok(ConnectionHandle(id));
            }
            if state.open_slots(self.inner.config.max_connections) {
                state.pending += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.next_waiter_id += 1;
                let waiter_id = state.next_waiter_id;
                state.waiters.push_back(Waiter {
                    id: waiter_id,
                    tx,
                    enqueued_at: Instant::now(),
                });
                state.wait_count += 1;
                debug!(
                    waiter = waiter_id,
                    waiting = state.waiters.len(),
                    "pool saturated, queued acquire"
                );
                Some((waiter_id, rx))
            }
        };

        match queued {
            None => self.open_for_caller().await,
            Some((waiter_id, rx)) => {
                let handoff = Handoff::new(self.clone(), Some(waiter_id), rx);
                self.wait_for_handoff(waiter_id, handoff, wait).await
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// The oldest queued waiter, if any, receives it directly. A connection
    /// flagged with [`mark_broken`](Self::mark_broken) is destroyed instead.
    pub async fn release(&self, handle: ConnectionHandle) -> Result<(), PoolError> {
        let id = handle.id();
        let broken = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(PoolError::Closed);
            }
            let status = state.checked_out(id)?.status;
            if status == ConnectionStatus::Error {
                let conn = state.remove(id);
                self.spawn_replacement(&mut state);
                conn
            } else {
                state.dispatch(id);
                debug!(handle = id, idle = state.idle.len(), "released connection");
                None
            }
        };

        if let Some(conn) = broken {
            close_backend(&conn.backend);
            debug!(handle = id, "destroyed broken connection on release");
        }
        Ok(())
    }

    /// Flag a checked-out connection as unusable; it is destroyed on release.
    pub async fn mark_broken(&self, handle: ConnectionHandle) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock().await;
        let id = handle.id();
        state.checked_out(id)?;
        if let Some(conn) = state.connections.get_mut(&id) {
            conn.status = ConnectionStatus::Error;
        }
        warn!(handle = id, "connection marked broken");
        Ok(())
    }

    /// Count one executed statement against a checked-out connection.
    pub async fn record_query(
        &self,
        handle: ConnectionHandle,
        execution_time: Duration,
    ) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock().await;
        let id = handle.id();
        state.checked_out(id)?;
        if let Some(conn) = state.connections.get_mut(&id) {
            conn.query_count += 1;
        }
        state.total_queries += 1;
        state.total_query_time += execution_time;
        Ok(())
    }

    /// Send bytes through a checked-out connection.
    pub async fn send(&self, handle: ConnectionHandle, data: &[u8]) -> Result<usize, PoolError> {
        let backend = self.backend_for(handle).await?;
        let data = data.to_vec();
        let id = handle.id();
        tokio::task::spawn_blocking(move || {
            backend
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .send(&data)
        })
        .await
        .map_err(|e| PoolError::Io {
            handle: id,
            message: e.to_string(),
        })?
        .map_err(|message| PoolError::Io { handle: id, message })
    }

    /// Receive up to `max_bytes` from a checked-out connection.
    pub async fn recv(
        &self,
        handle: ConnectionHandle,
        max_bytes: usize,
    ) -> Result<Vec<u8>, PoolError> {
        let backend = self.backend_for(handle).await?;
        let id = handle.id();
        tokio::task::spawn_blocking(move || {
            backend
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv(max_bytes)
        })
        .await
        .map_err(|e| PoolError::Io {
            handle: id,
            message: e.to_string(),
        })?
        .map_err(|message| PoolError::Io { handle: id, message })
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        let idle = state
            .connections
            .values()
            .filter(|c| c.status == ConnectionStatus::Idle)
            .count();
        let avg_query_time_ms = if state.total_queries > 0 {
            as_millis_f64(state.total_query_time) / state.total_queries as f64
        } else {
            0.0
        };

        PoolStats {
            total: state.connections.len(),
            idle,
            busy: state.connections.len() - idle,
            waiting: state.waiters.len(),
            max: self.inner.config.max_connections,
            total_queries: state.total_queries,
            avg_query_time_ms,
            wait_count: state.wait_count,
            timeouts: state.timeouts,
            created: state.created,
            destroyed: state.destroyed,
        }
    }

    /// Snapshot of every open connection, ordered by ID.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.inner.state.lock().await;
        let mut infos: Vec<ConnectionInfo> =
            state.connections.values().map(PooledConnection::info).collect();
        infos.sort_by_key(|c| c.id);
        infos
    }

    /// Destroy connections idle longer than `idle_timeout`, oldest first,
    /// without going below `min_connections`. Returns the number destroyed.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout();
        let min = self.inner.config.min_connections;

        let reaped = {
            let mut state = self.inner.state.lock().await;
            let now = Instant::now();
            let mut expired: Vec<(u64, Instant)> = state
                .idle
                .iter()
                .filter_map(|id| state.connections.get(id))
                .filter(|c| now.duration_since(c.last_used) > idle_timeout)
                .map(|c| (c.id, c.last_used))
                .collect();
            expired.sort_by_key(|(_, last_used)| *last_used);

            let mut reaped = Vec::new();
            for (id, _) in expired {
                if state.connections.len() <= min {
                    break;
                }
                if let Some(conn) = state.remove(id) {
                    reaped.push(conn);
                }
            }
            reaped
        };

        for conn in &reaped {
            close_backend(&conn.backend);
        }
        if !reaped.is_empty() {
            info!(
                reaped = reaped.len(),
                idle_timeout = ?idle_timeout,
                "reaped idle connections"
            );
        }
        reaped.len()
    }

    /// Ping every idle connection and destroy the ones that fail.
    /// Returns the number destroyed.
    ///
    /// Connections stay in the idle set while they are pinged, so acquires
    /// are not held up by a slow ping.
    pub async fn health_check_idle(&self) -> usize {
        let candidates: Vec<(u64, SharedBackend)> = {
            let state = self.inner.state.lock().await;
            state
                .idle
                .iter()
                .filter_map(|id| {
                    state
                        .connections
                        .get(id)
                        .map(|c| (*id, Arc::clone(&c.backend)))
                })
                .collect()
        };
        if candidates.is_empty() {
            return 0;
        }

        let results = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .map(|(id, backend)| {
                    let alive = backend
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .ping();
                    (id, alive)
                })
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();

        let dead = {
            let mut state = self.inner.state.lock().await;
            let mut dead = Vec::new();
            for (id, alive) in results {
                // A connection checked out mid-ping belongs to its caller now.
                let still_idle = state
                    .connections
                    .get(&id)
                    .is_some_and(|c| c.status == ConnectionStatus::Idle);
                if alive || !still_idle {
                    continue;
                }
                if let Some(conn) = state.remove(id) {
                    dead.push(conn);
                }
            }
            if !dead.is_empty() {
                self.spawn_replacement(&mut state);
            }
            dead
        };

        for conn in &dead {
            close_backend(&conn.backend);
            info!(handle = conn.id, "removed unhealthy idle connection");
        }
        dead.len()
    }

    /// Open connections until the pool holds `min_connections` again.
    /// Returns the number opened.
    pub async fn replenish(&self) -> usize {
        let min = self.inner.config.min_connections;
        let mut opened = 0;
        while self.reserve_slot(min).await {
            match self.open_into_pool().await {
                Ok(()) => opened += 1,
                Err(e) => {
                    warn!(error = %e, "failed to replenish connection pool");
                    break;
                }
            }
        }
        if opened > 0 {
            debug!(opened, "replenished connection pool");
        }
        opened
    }

    /// One reclamation cycle: reap, ping, top up.
    pub async fn sweep(&self) {
        let reaped = self.reap_idle().await;
        let dead = self.health_check_idle().await;
        let opened = self.replenish().await;
        let stats = self.stats().await;
        debug!(
            reaped,
            dead,
            opened,
            total = stats.total,
            idle = stats.idle,
            busy = stats.busy,
            waiting = stats.waiting,
            "pool sweep complete"
        );
    }

    /// Reject all queued waiters, close every connection and stop the sweep task.
    pub async fn shutdown(&self) {
        let connections = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            let rejected = state.waiters.len();
            for waiter in state.waiters.drain(..) {
                let _ = waiter.tx.send(Err(PoolError::ShuttingDown));
            }
            if rejected > 0 {
                warn!(rejected, "rejected queued acquires during shutdown");
            }
            state.idle.clear();
            state.connections.drain().map(|(_, c)| c).collect::<Vec<_>>()
        };

        for conn in &connections {
            close_backend(&conn.backend);
        }

        if let Some(task) = self.inner.sweeper.lock().await.take() {
            let _ = task.shutdown_tx.send(true);
            let _ = task.handle.await;
        }

        info!(closed = connections.len(), "connection pool shut down");
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// Log pool statistics at `tracing::info` level.
    pub async fn log_stats(&self) {
        let stats = self.stats().await;
        info!(
            total = stats.total,
            idle = stats.idle,
            busy = stats.busy,
            waiting = stats.waiting,
            total_queries = stats.total_queries,
            avg_query_time_ms = stats.avg_query_time_ms,
            timeouts = stats.timeouts,
            "pool statistics"
        );
    }

    // ── internals ───────────────────────────────────────────────────

    async fn reserve_slot(&self, limit: usize) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.closed || !state.open_slots(limit) {
            return false;
        }
        state.pending += 1;
        true
    }

    async fn open_backend(&self) -> Result<SharedBackend, PoolError> {
        let factory = Arc::clone(&self.inner.factory);
        let backend = tokio::task::spawn_blocking(move || factory.connect())
            .await
            .map_err(|e| PoolError::Connect(e.to_string()))?
            .map_err(PoolError::Connect)?;
        Ok(Arc::new(std::sync::Mutex::new(backend)))
    }

    /// Open a connection in an already reserved slot and give it to the
    /// oldest waiter or the idle set.
    ///
    /// The work runs on its own task, so the reservation is settled even if
    /// the caller stops waiting.
    async fn open_into_pool(&self) -> Result<(), PoolError> {
        let pool = self.clone();
        tokio::spawn(async move { pool.fill_reserved_slot().await })
            .await
            .map_err(|e| PoolError::Connect(e.to_string()))?
    }

    async fn fill_reserved_slot(&self) -> Result<(), PoolError> {
        let opened = self.open_backend().await;
        let mut state = self.inner.state.lock().await;
        state.pending -= 1;
        let backend = opened?;
        if state.closed {
            drop(state);
            close_backend(&backend);
            return Err(PoolError::Closed);
        }
        let id = state.insert(backend);
        state.dispatch(id);
        debug!(handle = id, total = state.connections.len(), "opened pooled connection");
        Ok(())
    }

    /// Open a connection in an already reserved slot for the calling acquire.
    ///
    /// The connect runs on its own task. If the caller goes away before it
    /// finishes, the new connection is dispatched to waiters or parked idle.
    async fn open_for_caller(&self) -> Result<ConnectionHandle, PoolError> {
        let (tx, rx) = oneshot::channel();
        let pool = self.clone();
        tokio::spawn(async move {
            let opened = pool.open_backend().await;
            let mut state = pool.inner.state.lock().await;
            state.pending -= 1;
            let backend = match opened {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(error = %e, "connection factory failed");
                    // The freed slot may let a queued caller through.
                    pool.spawn_replacement(&mut state);
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            if state.closed {
                drop(state);
                close_backend(&backend);
                let _ = tx.send(Err(PoolError::Closed));
                return;
            }
            let id = state.insert(backend);
            debug!(handle = id, total = state.connections.len(), "created new connection");
            if tx.send(Ok(ConnectionHandle(id))).is_err() {
                debug!(handle = id, "acquire abandoned while connecting");
                state.dispatch(id);
            }
        });

        let mut handoff = Handoff::new(self.clone(), None, rx);
        let result = (&mut handoff.rx).await.unwrap_or(Err(PoolError::Closed));
        handoff.settle(result)
    }

    async fn wait_for_handoff(
        &self,
        waiter_id: u64,
        mut handoff: Handoff,
        wait: Duration,
    ) -> Result<ConnectionHandle, PoolError> {
        let result = match tokio::time::timeout(wait, &mut handoff.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                let mut state = self.inner.state.lock().await;
                if state.unlink_waiter(waiter_id) {
                    state.timeouts += 1;
                    warn!(
                        waiter = waiter_id,
                        timeout = ?wait,
                        waiting = state.waiters.len(),
                        "acquire timed out"
                    );
                    Err(PoolError::Timeout(wait))
                } else {
                    drop(state);
                    // Resolved under the lock before the timeout path got it;
                    // the result is already in the channel.
                    handoff.rx.try_recv().unwrap_or(Err(PoolError::Closed))
                }
            }
        };
        handoff.settle(result)
    }

    /// Open one connection in the background for queued waiters when a slot
    /// has been freed.
    fn spawn_replacement(&self, state: &mut PoolState) {
        if state.closed
            || state.waiters.is_empty()
            || !state.open_slots(self.inner.config.max_connections)
        {
            return;
        }
        state.pending += 1;
        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(e) = pool.fill_reserved_slot().await {
                warn!(error = %e, "failed to open replacement connection");
            }
        });
    }

    async fn backend_for(&self, handle: ConnectionHandle) -> Result<SharedBackend, PoolError> {
        let state = self.inner.state.lock().await;
        if state.closed {
            return Err(PoolError::Closed);
        }
        let conn = state.checked_out(handle.id())?;
        Ok(Arc::clone(&conn.backend))
    }

    fn start_sweeper(&self) -> SweepTask {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.inner.config.health_check_interval();
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        ConnectionPool { inner }.sweep().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("pool sweeper shutting down");
                        break;
                    }
                }
            }
        });

        SweepTask {
            handle,
            shutdown_tx,
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
