//! Bounded retry around query execution.
//!
//! Transient engine failures (broken handle, locked database) are retried up
//! to `max_retries` times with `retry_delay` between attempts. A broken
//! handle is marked unhealthy and released before the delay, and the next
//! attempt runs on a freshly acquired connection. Query-language and
//! constraint failures are surfaced immediately.

use std::time::Duration;

use tracing::{info, warn};

use graphgate_core::{GatewayError, GatewayResult, PoolConfig, Row};

use crate::pool::{ConnectionPool, PooledConnection};

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    max_retries: u32,
    retry_delay: Duration,
    acquire_timeout: Duration,
}

impl RetryExecutor {
    pub fn new(max_retries: u32, retry_delay: Duration, acquire_timeout: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            acquire_timeout,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay, config.acquire_timeout)
    }

    /// Total attempts per query, first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Execute `query` on `conn`, retrying transient failures.
    ///
    /// Takes ownership of the connection so that it is released on every
    /// return path. Replacement connections are acquired from `pool` with
    /// the configured acquire timeout; a failed re-acquire ends the run with
    /// that error.
    pub async fn run(
        &self,
        pool: &ConnectionPool,
        conn: PooledConnection,
        query: &str,
    ) -> GatewayResult<Vec<Row>> {
        let max_attempts = self.max_attempts();
        let mut current = Some(conn);
        let mut attempt = 1;

        loop {
            let conn = match current.take() {
                Some(conn) => conn,
                None => pool.acquire(self.acquire_timeout).await?,
            };
            let conn = current.insert(conn);

            let err = match conn.execute(query).await {
                Ok(rows) => {
                    if attempt > 1 {
                        info!(attempt, connection_id = conn.id(), "query succeeded after retry");
                    }
                    return Ok(rows);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                warn!(
                    connection_id = conn.id(),
                    kind = %err.kind,
                    error = %err.message,
                    "query failed with non-retryable error"
                );
                return Err(GatewayError::Fatal(err));
            }

            if err.is_broken_handle() {
                conn.mark_unhealthy();
            }

            if attempt >= max_attempts {
                warn!(
                    attempts = attempt,
                    kind = %err.kind,
                    error = %err.message,
                    "query retries exhausted"
                );
                return Err(GatewayError::RetriesExhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            warn!(
                attempt,
                max_attempts,
                connection_id = conn.id(),
                kind = %err.kind,
                error = %err.message,
                delay_ms = self.retry_delay.as_millis() as u64,
                "query failed, retrying"
            );

            // Hand a broken handle back now so the pool can replace it.
            if !conn.is_usable() {
                current = None;
            }

            tokio::time::sleep(self.retry_delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use graphgate_core::mock::MockEngine;
    use graphgate_core::{ConnectionState, EngineError, EngineErrorKind};

    const WAIT: Duration = Duration::from_millis(200);

    fn test_config() -> PoolConfig {
        PoolConfig {
            max_connections: 2,
            initial_connections: 1,
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
            acquire_timeout: WAIT,
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
        }
    }

    fn setup() -> (ConnectionPool, MockEngine, RetryExecutor) {
        let engine = MockEngine::new();
        let config = test_config();
        let executor = RetryExecutor::from_config(&config);
        let pool = ConnectionPool::new(Arc::new(engine.clone()), "mock.kz", config).unwrap();
        (pool, engine, executor)
    }

    #[test]
    fn attempts_include_first_try() {
        let executor = RetryExecutor::new(3, Duration::ZERO, WAIT);
        assert_eq!(executor.max_attempts(), 4);
        assert_eq!(RetryExecutor::new(u32::MAX, Duration::ZERO, WAIT).max_attempts(), u32::MAX);
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let (pool, engine, executor) = setup();
        let conn = pool.acquire(WAIT).await.unwrap();
        let rows = executor.run(&pool, conn, "MATCH (n) RETURN n").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(engine.executed().len(), 1);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let (pool, engine, executor) = setup();
        engine.fail_next(EngineError::query("Binder exception: table Foo does not exist"));

        let conn = pool.acquire(WAIT).await.unwrap();
        let err = executor.run(&pool, conn, "MATCH (f:Foo) RETURN f").await.unwrap_err();
        assert!(matches!(err, GatewayError::Fatal(_)));
        assert_eq!(engine.executed().len(), 1);
        // The handle was fine; it goes back to idle.
        assert_eq!(pool.status().idle, 1);
        assert_eq!(pool.status().unhealthy, 0);
    }

    #[tokio::test]
    async fn constraint_violation_is_fatal() {
        let (pool, engine, executor) = setup();
        engine.fail_next(EngineError::constraint("duplicated primary key"));
        let conn = pool.acquire(WAIT).await.unwrap();
        let err = executor.run(&pool, conn, "CREATE (:Note {id: 'a'})").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Fatal(e) if e.kind == EngineErrorKind::Constraint
        ));
    }

    #[tokio::test]
    async fn broken_handle_is_replaced_and_retried() {
        let (pool, engine, executor) = setup();
        engine.fail_next(EngineError::connection("stale handle"));

        let conn = pool.acquire(WAIT).await.unwrap();
        let first_id = conn.id();
        let rows = executor.run(&pool, conn, "MATCH (n) RETURN n").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(engine.executed().len(), 2);
        assert_eq!(engine.opens(), 2);

        let infos = pool.connections();
        assert!(infos
            .iter()
            .any(|i| i.id == first_id && i.state == ConnectionState::Unhealthy));
        assert_eq!(pool.status().in_use, 0);
    }

    #[tokio::test]
    async fn unavailable_retries_on_same_handle() {
        let (pool, engine, executor) = setup();
        engine.fail_next(EngineError::unavailable("database is locked"));

        let conn = pool.acquire(WAIT).await.unwrap();
        executor.run(&pool, conn, "MATCH (n) RETURN n").await.unwrap();
        assert_eq!(engine.opens(), 1);
        assert_eq!(engine.executed().len(), 2);
        assert_eq!(pool.status().unhealthy, 0);
    }

    #[tokio::test]
    async fn retries_exhausted_surfaces_last_error() {
        let (pool, engine, executor) = setup();
        engine.fail_next(EngineError::unavailable("locked 1"));
        engine.fail_next(EngineError::unavailable("locked 2"));
        engine.fail_next(EngineError::unavailable("locked 3"));

        let conn = pool.acquire(WAIT).await.unwrap();
        let err = executor.run(&pool, conn, "MATCH (n) RETURN n").await.unwrap_err();
        match err {
            GatewayError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.message, "locked 3");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(engine.executed().len(), 3);
        assert_eq!(pool.status().in_use, 0);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let (pool, engine, _) = setup();
        let executor = RetryExecutor::new(0, Duration::ZERO, WAIT);
        engine.fail_next(EngineError::connection("gone"));

        let conn = pool.acquire(WAIT).await.unwrap();
        let err = executor.run(&pool, conn, "RETURN 2").await.unwrap_err();
        assert!(matches!(err, GatewayError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(pool.status().unhealthy, 1);
        assert_eq!(pool.status().in_use, 0);
    }

    #[tokio::test]
    async fn reacquire_failure_ends_the_run() {
        let (pool, engine, executor) = setup();
        let conn = pool.acquire(WAIT).await.unwrap();
        // Every replacement open fails after the first handle breaks.
        engine.fail_next(EngineError::connection("gone"));
        engine.fail_next_open(EngineError::internal("database file missing"));

        let err = executor.run(&pool, conn, "MATCH (n) RETURN n").await.unwrap_err();
        assert!(matches!(err, GatewayError::Open(_)));
        assert_eq!(pool.status().in_use, 0);
    }
}
