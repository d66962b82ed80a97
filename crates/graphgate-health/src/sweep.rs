//! A single health sweep over a connection pool.

use tracing::{debug, info, warn};

use graphgate_pool::ConnectionPool;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle connections past `idle_timeout`, marked unhealthy.
    pub expired: usize,
    /// Idle connections that were probed.
    pub probed: usize,
    /// Probes that failed; those connections were marked unhealthy.
    pub failed_probes: usize,
    /// Unhealthy connections closed.
    pub evicted: usize,
    /// Connections opened to get back to `initial_connections`.
    pub replenished: usize,
}

impl SweepReport {
    pub fn changed_pool(&self) -> bool {
        self.expired + self.failed_probes + self.evicted + self.replenished > 0
    }
}

/// Run one sweep: expire idle handles, probe the rest, evict, then top up.
///
/// Only idle connections are examined. Each probe checks its connection out
/// without waiting and never takes the last free permit, so a connection a
/// caller holds is never touched and a busy pool simply gets fewer probes
/// this round.
pub async fn sweep(pool: &ConnectionPool) -> SweepReport {
    let mut report = SweepReport::default();
    if pool.is_shut_down() {
        return report;
    }

    report.expired = pool.expire_idle();

    for id in pool.idle_ids() {
        let Some(mut conn) = pool.checkout_for_probe(id) else {
            continue;
        };
        report.probed += 1;
        if !conn.ping().await {
            conn.mark_unhealthy();
            report.failed_probes += 1;
            warn!(connection_id = id, "liveness probe failed");
        }
    }

    report.evicted = pool.evict_unhealthy();

    match pool.warm_up(pool.config().initial_connections).await {
        Ok(opened) => report.replenished = opened,
        Err(e) => warn!(error = %e, "failed to replenish connection pool"),
    }

    if report.changed_pool() {
        let status = pool.status();
        info!(
            expired = report.expired,
            probed = report.probed,
            failed_probes = report.failed_probes,
            evicted = report.evicted,
            replenished = report.replenished,
            idle = status.idle,
            in_use = status.in_use,
            "health sweep complete"
        );
    } else {
        debug!(probed = report.probed, "health sweep complete, no changes");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use graphgate_core::mock::MockEngine;
    use graphgate_core::{ConnectionState, EngineError, PoolConfig};

    const WAIT: Duration = Duration::from_millis(200);

    fn test_config() -> PoolConfig {
        PoolConfig {
            max_connections: 3,
            initial_connections: 0,
            max_retries: 1,
            retry_delay: Duration::from_millis(5),
            acquire_timeout: WAIT,
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
        }
    }

    fn make_pool(config: PoolConfig) -> (ConnectionPool, MockEngine) {
        let engine = MockEngine::new();
        let pool = ConnectionPool::new(Arc::new(engine.clone()), "mock.kz", config).unwrap();
        (pool, engine)
    }

    #[tokio::test]
    async fn healthy_idle_connections_survive() {
        let (pool, engine) = make_pool(test_config());
        pool.warm_up(2).await.unwrap();

        let report = sweep(&pool).await;
        assert_eq!(report, SweepReport {
            probed: 2,
            ..SweepReport::default()
        });
        assert!(!report.changed_pool());
        assert_eq!(pool.status().idle, 2);
        assert_eq!(engine.closes(), 0);
    }

    #[tokio::test]
    async fn liveness_checks_leave_a_permit_for_callers() {
        let config = PoolConfig {
            max_connections: 2,
            ..test_config()
        };
        let (pool, engine) = make_pool(config);
        pool.warm_up(2).await.unwrap();
        let _held = pool.acquire(WAIT).await.unwrap();
        engine.set_healthy(false);

        let report = sweep(&pool).await;
        assert_eq!(report.probed, 0);
        assert_eq!(pool.status().idle, 1);
        assert_eq!(engine.closes(), 0);
    }

    #[tokio::test]
    async fn failed_probe_evicts_connection() {
        let (pool, engine) = make_pool(test_config());
        pool.warm_up(2).await.unwrap();
        engine.set_healthy(false);

        let report = sweep(&pool).await;
        assert_eq!(report.failed_probes, 2);
        assert_eq!(report.evicted, 2);
        assert_eq!(pool.status().open(), 0);
        assert_eq!(engine.closes(), 2);
    }

    #[tokio::test]
    async fn idle_timeout_evicts_without_probing() {
        let config = PoolConfig {
            idle_timeout: Duration::from_millis(1),
            ..test_config()
        };
        let (pool, engine) = make_pool(config);
        pool.warm_up(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = sweep(&pool).await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.probed, 0);
        assert_eq!(report.evicted, 1);
        assert_eq!(pool.status().closed, 1);
        assert_eq!(engine.closes(), 1);
    }

    #[tokio::test]
    async fn in_use_connection_is_never_touched() {
        let config = PoolConfig {
            idle_timeout: Duration::from_millis(1),
            ..test_config()
        };
        let (pool, engine) = make_pool(config);
        let held = pool.acquire(WAIT).await.unwrap();
        engine.set_healthy(false);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = sweep(&pool).await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(held.state(), ConnectionState::InUse);
        assert_eq!(pool.status().in_use, 1);
        assert_eq!(engine.closes(), 0);
    }

    #[tokio::test]
    async fn broken_connections_from_callers_are_evicted() {
        let (pool, engine) = make_pool(test_config());
        let mut conn = pool.acquire(WAIT).await.unwrap();
        conn.mark_unhealthy();
        drop(conn);

        let report = sweep(&pool).await;
        assert_eq!(report.evicted, 1);
        assert_eq!(pool.status().unhealthy, 0);
        assert_eq!(engine.closes(), 1);
    }

    #[tokio::test]
    async fn replenishes_to_initial_connections() {
        let config = PoolConfig {
            initial_connections: 2,
            ..test_config()
        };
        let (pool, engine) = make_pool(config);
        pool.warm_up(2).await.unwrap();
        engine.set_healthy(false);

        // First sweep evicts both, then reopens two fresh handles.
        let report = sweep(&pool).await;
        assert_eq!(report.evicted, 2);
        assert_eq!(report.replenished, 2);
        assert_eq!(pool.status().idle, 2);
        assert_eq!(engine.opens(), 4);
    }

    #[tokio::test]
    async fn replenish_failure_does_not_abort_sweep() {
        let config = PoolConfig {
            initial_connections: 1,
            ..test_config()
        };
        let (pool, engine) = make_pool(config);
        engine.fail_next_open(EngineError::unavailable("database is locked"));

        let report = sweep(&pool).await;
        assert_eq!(report.replenished, 0);
        assert_eq!(pool.status().open(), 0);
    }

    #[tokio::test]
    async fn shut_down_pool_is_skipped() {
        let (pool, engine) = make_pool(test_config());
        pool.warm_up(1).await.unwrap();
        pool.shutdown();

        assert_eq!(sweep(&pool).await, SweepReport::default());
        assert_eq!(engine.opens(), 1);
    }
}
