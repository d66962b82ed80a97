//! Gateway-wide query counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use graphgate_core::{GatewayError, GatewayResult};

/// Lock-free counters updated once per submitted statement.
#[derive(Debug)]
pub struct QueryStats {
    started_at: Instant,
    total: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of [`QueryStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayStats {
    pub uptime_secs: u64,
    /// Statements submitted, rejected ones included.
    pub total_queries: u64,
    /// Statements that passed validation and then failed.
    pub failed_queries: u64,
    /// Statements turned away by the validator.
    pub rejected_queries: u64,
    /// Percentage of submitted statements that returned rows; 0 before the first.
    pub success_rate: f64,
}

impl Default for QueryStats {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Count one statement by its outcome.
    pub fn record<T>(&self, outcome: &GatewayResult<T>) {
        self.record_many(outcome, 1);
    }

    /// Count `statements` statements that share one outcome.
    pub fn record_many<T>(&self, outcome: &GatewayResult<T>, statements: u64) {
        self.total.fetch_add(statements, Ordering::Relaxed);
        match outcome {
            Ok(_) => {}
            Err(GatewayError::Validation(_)) => {
                self.rejected.fetch_add(statements, Ordering::Relaxed);
            }
            Err(_) => {
                self.failed.fetch_add(statements, Ordering::Relaxed);
            }
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> GatewayStats {
        let total = self.total.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let success_rate = if total == 0 {
            0.0
        } else {
            total.saturating_sub(failed + rejected) as f64 / total as f64 * 100.0
        };

        GatewayStats {
            uptime_secs: self.uptime().as_secs(),
            total_queries: total,
            failed_queries: failed,
            rejected_queries: rejected,
            success_rate,
        }
    }
}
