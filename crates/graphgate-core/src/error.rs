//! Error types for the GraphGate query gateway.

use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineError;

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors surfaced to gateway callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Query text rejected before execution. Carries the validator message.
    #[error("query rejected: {0}")]
    Validation(String),

    /// No connection became available within the acquire timeout.
    #[error("connection pool exhausted (waited {waited:?})")]
    ResourceExhausted { waited: Duration },

    #[error("connection pool is closed")]
    PoolClosed,

    /// A transient engine failure persisted through every attempt.
    #[error("query failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: EngineError,
    },

    /// The engine rejected the query; retrying cannot help.
    #[error("query failed: {0}")]
    Fatal(EngineError),

    /// The engine could not open a handle on the database.
    #[error("failed to open database: {0}")]
    Open(EngineError),

    /// The gateway is not accepting work in its current lifecycle state.
    #[error("gateway unavailable: {0}")]
    Lifecycle(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GatewayError {
    /// Whether a caller-side retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::ResourceExhausted { .. } | GatewayError::RetriesExhausted { .. } => true,
            GatewayError::Open(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Errors caused by the caller's input or usage rather than the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GatewayError::Validation(_) | GatewayError::Lifecycle(_) | GatewayError::Config(_)
        )
    }
}
