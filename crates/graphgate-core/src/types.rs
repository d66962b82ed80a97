//! Shared domain types: connection states, pool snapshots, validation verdicts.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a pooled engine connection.
///
/// ```text
/// Idle ──acquire──▶ InUse ──release──▶ Idle
///  │                  │
///  │ probe failed /   │ broken handle
///  │ idle timeout     ▼
///  └──────────────▶ Unhealthy ──evict/shutdown──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    InUse,
    Unhealthy,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::InUse => write!(f, "in_use"),
            ConnectionState::Unhealthy => write!(f, "unhealthy"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Point-in-time copy of pool occupancy. Never a live view into the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Connections ready for checkout.
    pub idle: usize,
    /// Connections checked out by callers.
    pub in_use: usize,
    /// Connections awaiting eviction.
    pub unhealthy: usize,
    /// Connections closed over the pool's lifetime.
    pub closed: u64,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Acquire calls that gave up waiting for capacity.
    pub timeouts: u64,
    pub max_connections: usize,
    /// Whether the pool has been shut down.
    pub shut_down: bool,
}

impl PoolStatus {
    /// Connections currently holding an engine handle.
    pub fn open(&self) -> usize {
        self.idle + self.in_use + self.unhealthy
    }
}

/// Per-connection snapshot, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub state: ConnectionState,
    /// Milliseconds since the handle was opened.
    pub age_ms: u64,
    /// Milliseconds since the handle was last checked out or returned.
    pub idle_ms: u64,
}

/// Message returned for every admissible query.
pub const VALID_QUERY_MESSAGE: &str = "Query is valid";

/// Verdict of the query validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub message: String,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            message: VALID_QUERY_MESSAGE.to_string(),
        }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
        }
    }

    /// The `(valid, message)` pair.
    pub fn into_parts(self) -> (bool, String) {
        (self.valid, self.message)
    }
}
