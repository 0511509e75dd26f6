//! dbkeeper-pool: bounded connection pool with FIFO waiters.
//!
//! Connections are produced by an injected [`ConnectionFactory`] and handed
//! to callers as opaque [`ConnectionHandle`]s. The pool never holds more
//! than `max_connections` connections and never hands one connection to two
//! callers at once.
//!
//! # Architecture
//!
//! ```text
//! acquire()
//!   → idle connection available        → mark busy, return handle
//!   → below max_connections            → reserve slot, factory.connect()
//!   → saturated                        → enqueue waiter (FIFO)
//!       → release() hands off directly → waiter resolved
//!       → acquire_timeout elapses      → waiter removed, PoolError::Timeout
//!
//! sweeper (every health_check_interval)
//!   → reap_idle()          idle > idle_timeout, never below min_connections
//!   → health_check_idle()  ping idle connections, drop dead ones
//!   → replenish()          top back up to min_connections
//! ```

pub mod error;
pub mod pool;
pub mod tcp;

pub use error::PoolError;
pub use pool::{
    ConnectionBackend, ConnectionFactory, ConnectionHandle, ConnectionInfo, ConnectionPool,
    ConnectionStatus, PoolStats,
};
pub use tcp::{TcpBackend, TcpConnectionFactory};
