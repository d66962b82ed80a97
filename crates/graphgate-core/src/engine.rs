//! The embedded graph engine seam.
//!
//! The engine itself is opaque: it can open a handle on a database, run query
//! text on that handle, and return rows or fail. Engine calls are synchronous;
//! the pool runs them on tokio's blocking pool, never under the pool lock.

use std::fmt;
use std::path::Path;

use thiserror::Error;

/// One result row: column name → value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Query used by the default liveness probe.
pub const PING_QUERY: &str = "RETURN 1";

/// Coarse failure classes reported by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    /// Broken or stale handle.
    Connection,
    /// Database locked by another process or temporarily busy.
    Unavailable,
    /// Parse, binder, or semantic failure in the query text.
    Query,
    /// Constraint violation.
    Constraint,
    /// Any other engine runtime failure.
    Internal,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineErrorKind::Connection => write!(f, "connection"),
            EngineErrorKind::Unavailable => write!(f, "unavailable"),
            EngineErrorKind::Query => write!(f, "query"),
            EngineErrorKind::Constraint => write!(f, "constraint"),
            EngineErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// An error reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Connection, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Unavailable, message)
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Query, message)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Constraint, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Internal, message)
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            EngineErrorKind::Connection | EngineErrorKind::Unavailable
        )
    }

    /// The handle that produced this error must not be reused.
    pub fn is_broken_handle(&self) -> bool {
        self.kind == EngineErrorKind::Connection
    }
}

/// A single open handle on the engine.
///
/// A handle is used by one caller at a time; the pool guarantees exclusive
/// access, so implementations need `Send` but not `Sync`.
pub trait EngineConnection: Send + fmt::Debug {
    /// Run query text and collect every result row.
    fn execute(&mut self, query: &str) -> Result<Vec<Row>, EngineError>;

    /// Lightweight liveness probe. Returns `true` if the handle is usable.
    fn ping(&mut self) -> bool {
        self.execute(PING_QUERY).is_ok()
    }

    /// Release the underlying engine resources.
    fn close(&mut self);
}

/// Opens handles on a database.
pub trait GraphEngine: Send + Sync {
    fn open(&self, database: &Path) -> Result<Box<dyn EngineConnection>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Echo {
        fail: bool,
    }

    impl EngineConnection for Echo {
        fn execute(&mut self, query: &str) -> Result<Vec<Row>, EngineError> {
            if self.fail {
                return Err(EngineError::connection("gone"));
            }
            let mut row = Row::new();
            row.insert("query".to_string(), query.into());
            Ok(vec![row])
        }

        fn close(&mut self) {}
    }

    #[test]
    fn retryable_kinds() {
        assert!(EngineError::connection("x").is_retryable());
        assert!(EngineError::unavailable("x").is_retryable());
        assert!(!EngineError::query("x").is_retryable());
        assert!(!EngineError::constraint("x").is_retryable());
        assert!(!EngineError::internal("x").is_retryable());
    }

    #[test]
    fn only_connection_errors_break_the_handle() {
        assert!(EngineError::connection("x").is_broken_handle());
        assert!(!EngineError::unavailable("x").is_broken_handle());
        assert!(!EngineError::query("x").is_broken_handle());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = EngineError::query("Parser exception: unexpected token");
        assert_eq!(err.to_string(), "query error: Parser exception: unexpected token");
    }

    #[test]
    fn default_ping_runs_probe_query() {
        assert!(Echo { fail: false }.ping());
        assert!(!Echo { fail: true }.ping());
    }
}
