//! graphgate-pool: bounded connection pool over an embedded graph engine.
//!
//! # Architecture
//!
//! ```text
//! acquire(timeout)
//!   → wait on capacity semaphore (bounded by timeout)
//!     → idle connection available → mark InUse, hand out PooledConnection
//!     → none idle → open a new handle (evicting an Unhealthy one if at max)
//! PooledConnection dropped
//!   → back to Idle, or parked as Unhealthy, or closed if the pool shut down
//! ```
//!
//! All connection state transitions happen under one `parking_lot::Mutex`
//! held only for the transition itself. Engine calls (open, execute, ping,
//! close) always run outside it.
//!
//! [`RetryExecutor`] wraps execution on a checked-out connection with a
//! bounded retry policy that swaps out broken handles between attempts.

pub mod pool;
pub mod retry;

pub use pool::{ConnectionPool, PooledConnection};
pub use retry::RetryExecutor;
