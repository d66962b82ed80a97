//! The query gateway: validation, pooled execution, and lifecycle.
//!
//! A gateway moves through three states:
//!
//! ```text
//! Created ──initialize──▶ Running ──cleanup──▶ Stopped
//!    │   ◀── failed init ───┘                    ▲
//!    └───────────────cleanup─────────────────────┘
//! ```
//!
//! `execute` is accepted only while Running. `initialize` and `cleanup` are
//! both idempotent and serialize with each other, so neither can observe a
//! half-built pool.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use graphgate_core::{
    ConnectionInfo, GatewayConfig, GatewayError, GatewayResult, GraphEngine, PoolStatus, Row,
    ValidationResult, WritePolicy,
};
use graphgate_health::HealthMonitor;
use graphgate_pool::{ConnectionPool, RetryExecutor};

use crate::preprocess::{QueryKind, QueryPreprocessor};
use crate::stats::{GatewayStats, QueryStats};
use crate::validator::QueryValidator;

enum Lifecycle {
    Created,
    Running(Running),
    Stopped,
}

struct Running {
    pool: ConnectionPool,
    monitor: Option<HealthMonitor>,
}

/// Validated, pooled, retried query execution against one database.
pub struct QueryGateway {
    engine: Arc<dyn GraphEngine>,
    config: GatewayConfig,
    validator: QueryValidator,
    preprocessor: QueryPreprocessor,
    retry: RetryExecutor,
    lifecycle: Mutex<Lifecycle>,
    /// Serializes `initialize` and `cleanup`.
    transition: tokio::sync::Mutex<()>,
    /// Single writer slot; `None` under `WritePolicy::Concurrent`.
    writer: Option<tokio::sync::Mutex<()>>,
    stats: QueryStats,
}

impl QueryGateway {
    /// Build an uninitialized gateway. No engine handle is opened yet.
    pub fn new(engine: Arc<dyn GraphEngine>, config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;
        let validator = QueryValidator::new(config.validation.clone())?;
        let preprocessor = QueryPreprocessor::new(config.execution.result_row_cap())?;
        let retry = RetryExecutor::from_config(&config.pool);
        let writer = match config.execution.write_policy {
            WritePolicy::SingleWriter => Some(tokio::sync::Mutex::new(())),
            WritePolicy::Concurrent => None,
        };

        Ok(Self {
            engine,
            config,
            validator,
            preprocessor,
            retry,
            lifecycle: Mutex::new(Lifecycle::Created),
            transition: tokio::sync::Mutex::new(()),
            writer,
            stats: QueryStats::new(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Build the pool, open `initial_connections` handles, and start the
    /// health monitor.
    ///
    /// A database that is locked or busy is retried `max_retries` times;
    /// any other open failure is returned at once. On failure the pool is
    /// shut down and the gateway stays uninitialized. Calling this on a
    /// running gateway does nothing.
    pub async fn initialize(&self) -> GatewayResult<()> {
        let _transition = self.transition.lock().await;
        match *self.lifecycle.lock() {
            Lifecycle::Running(_) => {
                debug!("gateway already initialized");
                return Ok(());
            }
            Lifecycle::Stopped => {
                return Err(GatewayError::Lifecycle(
                    "gateway has been cleaned up and cannot be reinitialized".to_string(),
                ));
            }
            Lifecycle::Created => {}
        }

        let database = self.config.database.path.clone();
        let pool = ConnectionPool::new(
            Arc::clone(&self.engine),
            database.clone(),
            self.config.pool.clone(),
        )?;

        if let Err(e) = self.warm_up(&pool).await {
            pool.shutdown();
            error!(database = %database.display(), error = %e, "gateway initialization failed");
            return Err(e);
        }

        let monitor = HealthMonitor::start(pool.clone());
        let status = pool.status();
        *self.lifecycle.lock() = Lifecycle::Running(Running { pool, monitor });

        info!(
            database = %database.display(),
            idle = status.idle,
            max_connections = status.max_connections,
            write_policy = ?self.config.execution.write_policy,
            "gateway initialized"
        );
        Ok(())
    }

    async fn warm_up(&self, pool: &ConnectionPool) -> GatewayResult<()> {
        let target = self.config.pool.initial_connections;
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;

        loop {
            match pool.warm_up(target).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        delay_ms = self.config.pool.retry_delay.as_millis() as u64,
                        "database unavailable during warm-up, retrying"
                    );
                    tokio::time::sleep(self.config.pool.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop the health monitor and shut the pool down.
    ///
    /// Safe to call any number of times, before `initialize`, or after a
    /// failed `initialize`. Connections still checked out close when their
    /// queries finish.
    pub async fn cleanup(&self) {
        let _transition = self.transition.lock().await;
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);

        match previous {
            Lifecycle::Running(Running { pool, monitor }) => {
                if let Some(monitor) = monitor {
                    monitor.stop().await;
                }
                let closed = pool.shutdown();
                info!(
                    database = %pool.database().display(),
                    closed,
                    "gateway cleaned up"
                );
            }
            Lifecycle::Created => debug!("cleanup on a gateway that was never initialized"),
            Lifecycle::Stopped => debug!("gateway already cleaned up"),
        }
    }

    /// The pool, if the gateway is accepting work.
    fn pool(&self) -> GatewayResult<ConnectionPool> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => Ok(running.pool.clone()),
            Lifecycle::Created => Err(GatewayError::Lifecycle(
                "gateway is not initialized".to_string(),
            )),
            Lifecycle::Stopped => Err(GatewayError::Lifecycle(
                "gateway has been cleaned up".to_string(),
            )),
        }
    }

    /// Pre-flight check without executing anything. Works in every lifecycle state.
    pub fn validate_query(&self, text: &str) -> ValidationResult {
        self.validator.validate(text)
    }

    /// Validate, then run `text` on a pooled connection and return its rows.
    pub async fn execute(&self, text: &str) -> GatewayResult<Vec<Row>> {
        let result = self.execute_one(text).await;
        self.stats.record(&result);
        result
    }

    async fn execute_one(&self, text: &str) -> GatewayResult<Vec<Row>> {
        let verdict = self.validator.validate(text);
        if !verdict.valid {
            info!(reason = %verdict.message, "query rejected");
            return Err(GatewayError::Validation(verdict.message));
        }

        let pool = self.pool()?;
        let query = self.preprocessor.prepare(text);
        self.run(&pool, &query).await
    }

    /// Run several statements in order and concatenate their rows.
    ///
    /// Every statement is validated before any of them runs. Execution stops
    /// at the first failure; statements already run are not undone.
    pub async fn execute_batch<S: AsRef<str>>(&self, statements: &[S]) -> GatewayResult<Vec<Row>> {
        for (index, statement) in statements.iter().enumerate() {
            let verdict = self.validator.validate(statement.as_ref());
            if !verdict.valid {
                info!(index, reason = %verdict.message, "batch rejected");
                return self.fail(GatewayError::Validation(verdict.message), statements.len());
            }
        }

        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(e) => return self.fail(e, statements.len()),
        };
        let mut rows = Vec::new();
        for (index, statement) in statements.iter().enumerate() {
            let query = self.preprocessor.prepare(statement.as_ref());
            let result = self.run(&pool, &query).await;
            self.stats.record(&result);
            match result {
                Ok(batch_rows) => rows.extend(batch_rows),
                Err(e) => {
                    warn!(index, total = statements.len(), error = %e, "batch stopped");
                    return Err(e);
                }
            }
        }
        Ok(rows)
    }

    /// Count every statement of a batch that never ran.
    fn fail<T>(&self, err: GatewayError, statements: usize) -> GatewayResult<T> {
        let result = Err(err);
        self.stats.record_many(&result, statements as u64);
        result
    }

    /// Acquire, execute with retries, release. The connection is returned to
    /// the pool on every path because `RetryExecutor::run` owns it.
    async fn run(&self, pool: &ConnectionPool, query: &str) -> GatewayResult<Vec<Row>> {
        let started = Instant::now();
        let kind = self.preprocessor.classify(query);
        let acquire_timeout = self.config.pool.acquire_timeout;

        let _write_slot = match (&self.writer, kind) {
            (Some(slot), QueryKind::Write) => Some(
                tokio::time::timeout(acquire_timeout, slot.lock())
                    .await
                    .map_err(|_| {
                        warn!(
                            timeout_ms = acquire_timeout.as_millis() as u64,
                            "timed out waiting for the writer slot"
                        );
                        GatewayError::ResourceExhausted {
                            waited: acquire_timeout,
                        }
                    })?,
            ),
            _ => None,
        };

        let conn = pool.acquire(acquire_timeout).await?;
        let connection_id = conn.id();
        let result = self.retry.run(pool, conn, query).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(rows) => info!(
                %kind,
                connection_id,
                rows = rows.len(),
                elapsed_ms,
                "query completed"
            ),
            Err(e) => error!(
                %kind,
                connection_id,
                elapsed_ms,
                error = %e,
                query = %truncate(query, 200),
                "query failed"
            ),
        }
        result
    }

    /// Snapshot of pool occupancy.
    pub fn get_pool_status(&self) -> GatewayResult<PoolStatus> {
        Ok(self.pool()?.status())
    }

    /// Per-connection snapshot of the pool.
    pub fn connections(&self) -> GatewayResult<Vec<ConnectionInfo>> {
        Ok(self.pool()?.connections())
    }

    pub fn stats(&self) -> GatewayStats {
        self.stats.snapshot()
    }
}

impl Drop for QueryGateway {
    fn drop(&mut self) {
        let previous = std::mem::replace(self.lifecycle.get_mut(), Lifecycle::Stopped);
        if let Lifecycle::Running(Running { pool, monitor }) = previous {
            if let Some(monitor) = monitor {
                monitor.abort();
            }
            pool.shutdown();
            warn!("gateway dropped without cleanup");
        }
    }
}

impl std::fmt::Debug for QueryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryGateway")
            .field("database", &self.config.database.path)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
