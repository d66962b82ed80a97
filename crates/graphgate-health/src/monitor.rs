//! Health monitor: background task that sweeps a pool on a fixed period.
//!
//! The monitor owns a clone of the pool handle and nothing else. Each tick
//! runs [`sweep`], which goes through the pool's public API and therefore
//! through the same lock as acquire/release.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use graphgate_pool::ConnectionPool;

use crate::sweep::sweep;

/// How long `stop` waits for an in-progress sweep before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Periodic health sweeps for one pool.
pub struct HealthMonitor {
    /// Handle to the background sweep task.
    handle: JoinHandle<()>,
    /// Shutdown signal for the sweep task.
    shutdown_tx: watch::Sender<bool>,
    interval: Duration,
    sweeps: Arc<AtomicU64>,
}

impl HealthMonitor {
    /// Start sweeping `pool` every `health_check_interval`.
    ///
    /// Returns `None` when the interval is zero, which disables monitoring.
    /// Must be called from within a tokio runtime.
    pub fn start(pool: ConnectionPool) -> Option<Self> {
        let interval = pool.config().health_check_interval;
        if interval.is_zero() {
            debug!(database = %pool.database().display(), "health monitor disabled");
            return None;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeps = Arc::new(AtomicU64::new(0));
        let database = pool.database().display().to_string();

        let handle = tokio::spawn(run_health_loop(
            pool,
            interval,
            Arc::clone(&sweeps),
            shutdown_rx,
        ));

        info!(
            %database,
            interval_ms = interval.as_millis() as u64,
            "health monitor started"
        );
        Some(Self {
            handle,
            shutdown_tx,
            interval,
            sweeps,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sweeps completed so far.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the loop to stop and wait for it to exit.
    ///
    /// A sweep already in progress is allowed to finish; if it is still
    /// running after a grace period, the task is aborted.
    pub async fn stop(self) {
        let Self {
            mut handle,
            shutdown_tx,
            ..
        } = self;

        let _ = shutdown_tx.send(true);
        match tokio::time::timeout(STOP_GRACE, &mut handle).await {
            Ok(_) => info!("health monitor stopped"),
            Err(_) => {
                handle.abort();
                warn!(
                    grace_ms = STOP_GRACE.as_millis() as u64,
                    "health monitor did not stop in time, aborted"
                );
            }
        }
    }

    /// Signal the loop and abort it without waiting. For use from `Drop`.
    pub fn abort(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        debug!("health monitor aborted");
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("interval", &self.interval)
            .field("sweeps", &self.sweeps())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// The sweep loop for a single pool.
async fn run_health_loop(
    pool: ConnectionPool,
    interval: Duration,
    sweeps: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(
        database = %pool.database().display(),
        interval_ms = interval.as_millis() as u64,
        "health loop starting"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                sweep(&pool).await;
                sweeps.fetch_add(1, Ordering::SeqCst);
                if pool.is_shut_down() {
                    debug!("pool shut down, health loop exiting");
                    break;
                }
            }
            _ = shutdown.changed() => {
                debug!("health loop shutting down");
                break;
            }
        }
    }
}
