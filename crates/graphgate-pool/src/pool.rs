//! Bounded pool of engine connections.
//!
//! Capacity is enforced twice: a semaphore with `max_connections` permits
//! bounds concurrent checkouts (and is what waiters suspend on), and the
//! locked [`PoolState`] counts every open handle so that
//! `idle + in_use + unhealthy` never exceeds `max_connections`.
//!
//! Every path that opens a handle holds a permit, so a caller holding a
//! permit always finds either an idle connection, a free slot, or an
//! unhealthy connection it may evict and replace.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use graphgate_core::{
    ConnectionInfo, ConnectionState, EngineConnection, EngineError, GatewayError, GatewayResult,
    GraphEngine, PoolConfig, PoolStatus, Row,
};

/// An open handle that is not checked out.
struct Slot {
    id: u64,
    created_at: Instant,
    last_used_at: Instant,
    backend: Box<dyn EngineConnection>,
}

/// Metadata kept for a checked-out connection while its handle is away.
#[derive(Clone, Copy)]
struct Checkout {
    created_at: Instant,
    last_used_at: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<Slot>,
    in_use: HashMap<u64, Checkout>,
    unhealthy: Vec<Slot>,
    /// Slots reserved by callers currently opening a handle.
    opening: usize,
    next_id: u64,
    created: u64,
    closed: u64,
    timeouts: u64,
    shut_down: bool,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.unhealthy.len() + self.opening
    }

    /// Give a freshly opened handle an ID and count it as created.
    fn register(&mut self, backend: Box<dyn EngineConnection>) -> Slot {
        self.next_id += 1;
        self.created += 1;
        let now = Instant::now();
        Slot {
            id: self.next_id,
            created_at: now,
            last_used_at: now,
            backend,
        }
    }
}

struct PoolInner {
    database: PathBuf,
    config: PoolConfig,
    engine: Arc<dyn GraphEngine>,
    state: Mutex<PoolState>,
    capacity: Arc<Semaphore>,
}

/// Bounded pool of connections to one database.
///
/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create an empty pool. Handles are opened lazily, or eagerly via [`warm_up`](Self::warm_up).
    pub fn new(
        engine: Arc<dyn GraphEngine>,
        database: impl Into<PathBuf>,
        config: PoolConfig,
    ) -> GatewayResult<Self> {
        config.validate()?;
        let capacity = Arc::new(Semaphore::new(config.max_connections));
        Ok(Self {
            inner: Arc::new(PoolInner {
                database: database.into(),
                config,
                engine,
                state: Mutex::new(PoolState::default()),
                capacity,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn database(&self) -> &Path {
        &self.inner.database
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }

    /// Check out a connection, waiting at most `timeout` for capacity.
    ///
    /// Reuses the most recently returned idle connection if there is one,
    /// otherwise opens a new handle. Fails with `ResourceExhausted` when the
    /// wait expires and with `PoolClosed` once the pool has shut down.
    pub async fn acquire(&self, timeout: Duration) -> GatewayResult<PooledConnection> {
        if self.is_shut_down() {
            return Err(GatewayError::PoolClosed);
        }

        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.capacity).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(GatewayError::PoolClosed),
            Err(_) => {
                self.inner.state.lock().timeouts += 1;
                warn!(
                    database = %self.inner.database.display(),
                    max_connections = self.inner.config.max_connections,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for a pooled connection"
                );
                return Err(GatewayError::ResourceExhausted { waited: timeout });
            }
        };

        self.checkout(permit).await
    }

    /// Return a connection to the pool. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    async fn checkout(&self, permit: OwnedSemaphorePermit) -> GatewayResult<PooledConnection> {
        {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(GatewayError::PoolClosed);
            }
            if let Some(mut slot) = state.idle.pop() {
                let now = Instant::now();
                slot.last_used_at = now;
                state.in_use.insert(
                    slot.id,
                    Checkout {
                        created_at: slot.created_at,
                        last_used_at: now,
                    },
                );
                debug!(
                    connection_id = slot.id,
                    idle = state.idle.len(),
                    in_use = state.in_use.len(),
                    "reused idle connection"
                );
                return Ok(PooledConnection::new(slot, true, permit, Arc::clone(&self.inner)));
            }
        }

        self.open_new(permit).await
    }

    /// Open a fresh handle for a caller that already holds a permit.
    async fn open_new(&self, permit: OwnedSemaphorePermit) -> GatewayResult<PooledConnection> {
        let (evicted, mut reservation) = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(GatewayError::PoolClosed);
            }
            let evicted = if state.occupied() >= self.inner.config.max_connections {
                state.unhealthy.pop()
            } else {
                None
            };
            debug_assert!(
                evicted.is_some() || state.occupied() < self.inner.config.max_connections,
                "permit holder found no free slot"
            );
            if evicted.is_some() {
                state.closed += 1;
            }
            state.opening += 1;
            let reservation = OpenReservation {
                pool: Arc::clone(&self.inner),
                backend: None,
                permit: Some(permit),
                settled: false,
            };
            (evicted, reservation)
        };

        if let Some(slot) = evicted {
            close_slot(slot, "replaced unhealthy connection");
        }

        // The blocking task owns the reservation until this future collects it.
        let engine = Arc::clone(&self.inner.engine);
        let database = self.inner.database.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let backend = engine.open(&database)?;
            reservation.backend = Some(backend);
            Ok::<_, EngineError>(reservation)
        })
        .await;

        let reservation = match opened {
            Ok(Ok(reservation)) => reservation,
            Ok(Err(e)) => {
                warn!(
                    database = %self.inner.database.display(),
                    error = %e,
                    "failed to open engine connection"
                );
                return Err(GatewayError::Open(e));
            }
            Err(e) => {
                return Err(GatewayError::Open(EngineError::internal(format!(
                    "engine open task failed: {e}"
                ))));
            }
        };

        let (slot, permit) = reservation.into_checkout()?;
        Ok(PooledConnection::new(slot, true, permit, Arc::clone(&self.inner)))
    }

    /// Open handles until `target` connections are live (idle or in use).
    ///
    /// Stops early when no capacity is free. Returns the number opened; the
    /// first open failure is returned as `GatewayError::Open`.
    pub async fn warm_up(&self, target: usize) -> GatewayResult<usize> {
        let target = target.min(self.inner.config.max_connections);
        let mut opened = 0;

        loop {
            {
                let state = self.inner.state.lock();
                if state.shut_down {
                    return Err(GatewayError::PoolClosed);
                }
                if state.idle.len() + state.in_use.len() + state.opening >= target {
                    break;
                }
            }

            let permit = match Arc::clone(&self.inner.capacity).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => return Err(GatewayError::PoolClosed),
                Err(TryAcquireError::NoPermits) => break,
            };

            // Dropping the fresh connection parks it as idle.
            drop(self.open_new(permit).await?);
            opened += 1;
        }

        if opened > 0 {
            info!(
                database = %self.inner.database.display(),
                opened,
                target,
                "connection pool warmed"
            );
        }
        Ok(opened)
    }

    /// IDs of connections currently idle, oldest activity first.
    pub fn idle_ids(&self) -> Vec<u64> {
        let state = self.inner.state.lock();
        let mut idle: Vec<(Instant, u64)> =
            state.idle.iter().map(|s| (s.last_used_at, s.id)).collect();
        idle.sort();
        idle.into_iter().map(|(_, id)| id).collect()
    }

    /// Check out a specific idle connection for a liveness probe, without waiting.
    ///
    /// Returns `None` if the connection is no longer idle or taking it would
    /// use up the last free permit, so a probe never makes a caller wait.
    /// Unlike [`acquire`](Self::acquire), returning the connection leaves its
    /// `last_used_at` untouched, so probing never postpones idle expiry.
    pub fn checkout_for_probe(&self, id: u64) -> Option<PooledConnection> {
        if self.inner.capacity.available_permits() <= 1 {
            return None;
        }
        let permit = Arc::clone(&self.inner.capacity).try_acquire_owned().ok()?;
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return None;
        }
        let pos = state.idle.iter().position(|s| s.id == id)?;
        let slot = state.idle.remove(pos);
        state.in_use.insert(
            slot.id,
            Checkout {
                created_at: slot.created_at,
                last_used_at: slot.last_used_at,
            },
        );
        Some(PooledConnection::new(slot, false, permit, Arc::clone(&self.inner)))
    }

    /// Mark idle connections unused for longer than `idle_timeout` as unhealthy.
    pub fn expire_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let mut state = self.inner.state.lock();

        let (expired, fresh): (Vec<Slot>, Vec<Slot>) = std::mem::take(&mut state.idle)
            .into_iter()
            .partition(|s| s.last_used_at.elapsed() > idle_timeout);
        state.idle = fresh;

        let count = expired.len();
        state.unhealthy.extend(expired);
        if count > 0 {
            info!(
                database = %self.inner.database.display(),
                expired = count,
                remaining_idle = state.idle.len(),
                "expired idle connections"
            );
        }
        count
    }

    /// Close every unhealthy connection. Handles are closed outside the lock.
    pub fn evict_unhealthy(&self) -> usize {
        let evicted = {
            let mut state = self.inner.state.lock();
            let evicted = std::mem::take(&mut state.unhealthy);
            state.closed += evicted.len() as u64;
            evicted
        };

        let count = evicted.len();
        for slot in evicted {
            close_slot(slot, "evicted unhealthy connection");
        }
        count
    }

    /// Close all connections and reject further checkouts.
    ///
    /// Idle and unhealthy handles close immediately; checked-out handles
    /// close when their holders release them. Waiters in `acquire` wake
    /// with `PoolClosed`. Calling this again is a no-op returning 0.
    pub fn shutdown(&self) -> usize {
        let (slots, in_flight) = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return 0;
            }
            state.shut_down = true;
            let mut slots = std::mem::take(&mut state.idle);
            slots.append(&mut state.unhealthy);
            state.closed += slots.len() as u64;
            (slots, state.in_use.len())
        };
        self.inner.capacity.close();

        let count = slots.len();
        for slot in slots {
            close_slot(slot, "closed connection on shutdown");
        }
        info!(
            database = %self.inner.database.display(),
            closed = count,
            in_flight,
            "connection pool shut down"
        );
        count
    }

    /// Snapshot of pool occupancy.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            unhealthy: state.unhealthy.len(),
            closed: state.closed,
            created: state.created,
            timeouts: state.timeouts,
            max_connections: self.inner.config.max_connections,
            shut_down: state.shut_down,
        }
    }

    /// Snapshot of every open connection, ordered by ID.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.inner.state.lock();
        let slot_info = |slot: &Slot, conn_state| ConnectionInfo {
            id: slot.id,
            state: conn_state,
            age_ms: slot.created_at.elapsed().as_millis() as u64,
            idle_ms: slot.last_used_at.elapsed().as_millis() as u64,
        };

        let mut infos: Vec<ConnectionInfo> = state
            .idle
            .iter()
            .map(|s| slot_info(s, ConnectionState::Idle))
            .chain(
                state
                    .unhealthy
                    .iter()
                    .map(|s| slot_info(s, ConnectionState::Unhealthy)),
            )
            .chain(state.in_use.iter().map(|(id, c)| ConnectionInfo {
                id: *id,
                state: ConnectionState::InUse,
                age_ms: c.created_at.elapsed().as_millis() as u64,
                idle_ms: c.last_used_at.elapsed().as_millis() as u64,
            }))
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

fn close_slot(mut slot: Slot, reason: &'static str) {
    slot.backend.close();
    debug!(connection_id = slot.id, reason, "closed engine connection");
}

/// Capacity held while a handle is being opened.
///
/// The blocking open task owns it. If the caller stops waiting, dropping the
/// reservation parks the new handle as idle, or only frees the slot when the
/// open failed, before the permit goes back to the semaphore.
struct OpenReservation {
    pool: Arc<PoolInner>,
    backend: Option<Box<dyn EngineConnection>>,
    permit: Option<OwnedSemaphorePermit>,
    settled: bool,
}

impl OpenReservation {
    /// Hand the opened handle to the waiting caller as a checkout.
    fn into_checkout(mut self) -> GatewayResult<(Slot, OwnedSemaphorePermit)> {
        let (Some(mut backend), Some(permit)) = (self.backend.take(), self.permit.take()) else {
            return Err(GatewayError::Open(EngineError::internal(
                "engine open finished without a handle",
            )));
        };
        self.settled = true;

        let mut state = self.pool.state.lock();
        state.opening -= 1;
        if state.shut_down {
            state.closed += 1;
            drop(state);
            backend.close();
            return Err(GatewayError::PoolClosed);
        }

        let slot = state.register(backend);
        state.in_use.insert(
            slot.id,
            Checkout {
                created_at: slot.created_at,
                last_used_at: slot.last_used_at,
            },
        );
        debug!(
            connection_id = slot.id,
            database = %self.pool.database.display(),
            open = state.occupied(),
            "opened new connection"
        );
        Ok((slot, permit))
    }
}

impl Drop for OpenReservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.pool.state.lock();
        state.opening -= 1;
        let Some(mut backend) = self.backend.take() else {
            return;
        };

        if state.shut_down {
            state.closed += 1;
            drop(state);
            backend.close();
            debug!("closed handle whose open outlived the pool");
            return;
        }

        let slot = state.register(backend);
        debug!(connection_id = slot.id, "parked connection opened for an abandoned checkout");
        state.idle.push(slot);
    }
}

type EngineCall = JoinHandle<(Box<dyn EngineConnection>, Result<Vec<Row>, EngineError>)>;

/// A connection checked out of a [`ConnectionPool`].
///
/// The holder has exclusive use of the engine handle. Dropping it returns
/// the connection to the pool on every exit path: back to idle, parked as
/// unhealthy if [`mark_unhealthy`](Self::mark_unhealthy) was called, or
/// closed if the pool has shut down in the meantime. A query abandoned
/// mid-flight keeps its connection checked out until the engine finishes it.
pub struct PooledConnection {
    id: u64,
    created_at: Instant,
    backend: Option<Box<dyn EngineConnection>>,
    /// Engine call on the blocking pool; it holds the handle until joined.
    running: Option<EngineCall>,
    unhealthy: bool,
    touch_on_release: bool,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    fn new(
        slot: Slot,
        touch_on_release: bool,
        permit: OwnedSemaphorePermit,
        pool: Arc<PoolInner>,
    ) -> Self {
        Self {
            id: slot.id,
            created_at: slot.created_at,
            backend: Some(slot.backend),
            running: None,
            unhealthy: false,
            touch_on_release,
            pool,
            permit: Some(permit),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> ConnectionState {
        if self.unhealthy {
            ConnectionState::Unhealthy
        } else {
            ConnectionState::InUse
        }
    }

    /// Whether another query may be run on this handle.
    pub fn is_usable(&self) -> bool {
        !self.unhealthy && (self.backend.is_some() || self.running.is_some())
    }

    /// Keep this handle out of circulation once released.
    pub fn mark_unhealthy(&mut self) {
        self.unhealthy = true;
    }

    /// Run a query on the blocking pool and collect its rows.
    ///
    /// Dropping the returned future does not stop the query. The call keeps
    /// the handle until it finishes; the next call on this connection, or
    /// its release, waits for that first.
    pub async fn execute(&mut self, query: &str) -> Result<Vec<Row>, EngineError> {
        let query = query.to_string();
        self.call(move |backend| backend.execute(&query)).await
    }

    /// Liveness probe on the blocking pool.
    pub async fn ping(&mut self) -> bool {
        self.call(|backend| {
            if backend.ping() {
                Ok(Vec::new())
            } else {
                Err(EngineError::connection("liveness probe failed"))
            }
        })
        .await
        .is_ok()
    }

    async fn call<F>(&mut self, call: F) -> Result<Vec<Row>, EngineError>
    where
        F: FnOnce(&mut Box<dyn EngineConnection>) -> Result<Vec<Row>, EngineError>
            + Send
            + 'static,
    {
        if let Some(Err(e)) = self.join_running().await {
            if e.is_broken_handle() {
                self.unhealthy = true;
            }
        }

        let Some(mut backend) = self.backend.take() else {
            return Err(EngineError::connection(format!(
                "connection {} has no engine handle",
                self.id
            )));
        };
        self.running = Some(tokio::task::spawn_blocking(move || {
            let result = call(&mut backend);
            (backend, result)
        }));

        match self.join_running().await {
            Some(result) => result,
            None => Err(EngineError::connection(format!(
                "connection {} lost its engine call",
                self.id
            ))),
        }
    }

    /// Wait for the call in flight, if any, and take the handle back.
    ///
    /// Cancel-safe: if this future is dropped the call stays in `running`.
    async fn join_running(&mut self) -> Option<Result<Vec<Row>, EngineError>> {
        let joined = self.running.as_mut()?.await;
        self.running = None;
        Some(match joined {
            Ok((backend, result)) => {
                self.backend = Some(backend);
                result
            }
            Err(e) => {
                self.unhealthy = true;
                Err(EngineError::connection(format!("engine task failed: {e}")))
            }
        })
    }
}

/// What a released connection needs to find its way back into the pool.
struct Release {
    id: u64,
    created_at: Instant,
    unhealthy: bool,
    touch_on_release: bool,
    pool: Arc<PoolInner>,
    // Dropped after `finish` has put the connection back.
    permit: Option<OwnedSemaphorePermit>,
}

impl Release {
    fn finish(self, backend: Option<Box<dyn EngineConnection>>) {
        let mut to_close = None;

        {
            let mut state = self.pool.state.lock();
            let checkout = state.in_use.remove(&self.id);

            match backend {
                Some(backend) if state.shut_down => {
                    state.closed += 1;
                    to_close = Some(backend);
                }
                Some(backend) => {
                    let last_used_at = if self.touch_on_release {
                        Instant::now()
                    } else {
                        checkout.map_or_else(Instant::now, |c| c.last_used_at)
                    };
                    let slot = Slot {
                        id: self.id,
                        created_at: self.created_at,
                        last_used_at,
                        backend,
                    };
                    if self.unhealthy {
                        state.unhealthy.push(slot);
                        debug!(connection_id = self.id, "parked unhealthy connection");
                    } else {
                        state.idle.push(slot);
                        debug!(
                            connection_id = self.id,
                            idle = state.idle.len(),
                            "returned connection to pool"
                        );
                    }
                }
                None => {
                    state.closed += 1;
                    debug!(connection_id = self.id, "discarded connection without engine handle");
                }
            }
        }

        if let Some(mut backend) = to_close {
            backend.close();
            debug!(connection_id = self.id, "closed connection released after shutdown");
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let mut release = Release {
            id: self.id,
            created_at: self.created_at,
            unhealthy: self.unhealthy,
            touch_on_release: self.touch_on_release,
            pool: Arc::clone(&self.pool),
            permit: self.permit.take(),
        };

        let Some(running) = self.running.take() else {
            release.finish(self.backend.take());
            return;
        };

        // An abandoned call still owns the handle; release once it finishes.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(connection_id = self.id, "release waits for a running engine call");
                runtime.spawn(async move {
                    let backend = match running.await {
                        Ok((backend, result)) => {
                            if result.as_ref().is_err_and(|e| e.is_broken_handle()) {
                                release.unhealthy = true;
                            }
                            Some(backend)
                        }
                        Err(_) => None,
                    };
                    release.finish(backend);
                });
            }
            Err(_) => {
                warn!(
                    connection_id = self.id,
                    "engine call outlived its runtime, discarding connection"
                );
                release.finish(None);
            }
        }
    }
}

// ── Debug impls (cannot auto-derive due to dyn trait) ───────────────

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("database", &self.inner.database)
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
