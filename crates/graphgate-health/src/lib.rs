//! graphgate-health: health checking and idle eviction for GraphGate pools.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor (background task, every health_check_interval)
//!   └── sweep(pool)
//!       ├── expire idle connections past idle_timeout → Unhealthy
//!       ├── probe each remaining idle connection → Unhealthy on failure
//!       ├── evict Unhealthy connections (closed outside the pool lock)
//!       └── replenish up to initial_connections
//! ```
//!
//! The monitor talks to the pool only through the pool's own API, which
//! takes the same lock as acquire/release. Probes check a connection out
//! like any caller would, so a connection in use is never probed.

pub mod monitor;
pub mod sweep;

pub use monitor::HealthMonitor;
pub use sweep::{SweepReport, sweep};
