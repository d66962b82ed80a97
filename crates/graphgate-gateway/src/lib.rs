//! graphgate-gateway: the public face of GraphGate.
//!
//! # Architecture
//!
//! ```text
//! QueryGateway::execute(text)
//!   ├── QueryValidator::validate      reject early, nothing touched
//!   ├── lifecycle check               Running only
//!   ├── QueryPreprocessor::prepare    aliases, trailing ';', automatic LIMIT
//!   ├── writer slot                   writes only, under WritePolicy::SingleWriter
//!   ├── ConnectionPool::acquire       bounded wait
//!   └── RetryExecutor::run            connection released on every path
//! ```
//!
//! A [`HealthMonitor`](graphgate_health::HealthMonitor) runs beside the
//! gateway for as long as it is initialized.

pub mod gateway;
pub mod preprocess;
pub mod stats;
pub mod validator;

pub use gateway::QueryGateway;
pub use preprocess::{QueryKind, QueryPreprocessor};
pub use stats::{GatewayStats, QueryStats};
pub use validator::QueryValidator;
