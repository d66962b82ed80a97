//! graphgate-core: shared types for the GraphGate query gateway.
//!
//! Holds everything the pool, health monitor, and gateway crates agree on:
//!
//! - [`config`]: TOML-backed `GatewayConfig` and its sections
//! - [`engine`]: the opaque embedded-engine seam (`GraphEngine`, `EngineConnection`)
//! - [`error`]: the `GatewayError` taxonomy
//! - [`types`]: connection states, pool snapshots, validation verdicts
//!
//! With the `test-util` feature, [`mock`] provides a scriptable in-memory
//! engine for tests in downstream crates.

pub mod config;
pub mod engine;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod types;

pub use config::{
    DatabaseConfig, ExecutionConfig, GatewayConfig, PoolConfig, ValidationConfig, WritePolicy,
};
pub use engine::{EngineConnection, EngineError, EngineErrorKind, GraphEngine, Row, PING_QUERY};
pub use error::{GatewayError, GatewayResult};
pub use types::*;
