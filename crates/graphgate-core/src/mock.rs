//! Scriptable in-memory engine for tests.
//!
//! Every handle opened by a [`MockEngine`] shares one control block, so a
//! test can flip liveness, queue failures, and read counters after handles
//! have been moved into a pool.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::engine::{EngineConnection, EngineError, GraphEngine, PING_QUERY, Row};

#[derive(Debug, Default)]
struct Control {
    opens: AtomicU64,
    closes: AtomicU64,
    open_failures: Mutex<VecDeque<EngineError>>,
    open_delay: Mutex<Duration>,
    healthy: AtomicBool,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Mutex<Duration>,
    failures: Mutex<VecDeque<EngineError>>,
    executed: Mutex<Vec<String>>,
}

/// Engine double whose handles echo their query back as a single row.
#[derive(Debug, Clone)]
pub struct MockEngine {
    control: Arc<Control>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        let control = Control::default();
        control.healthy.store(true, Ordering::SeqCst);
        Self {
            control: Arc::new(control),
        }
    }

    /// Handles opened so far.
    pub fn opens(&self) -> u64 {
        self.control.opens.load(Ordering::SeqCst)
    }

    /// Handles closed so far.
    pub fn closes(&self) -> u64 {
        self.control.closes.load(Ordering::SeqCst)
    }

    /// Fail the next `open` call with `error`. Calls queue up.
    pub fn fail_next_open(&self, error: EngineError) {
        self.control.open_failures.lock().push_back(error);
    }

    /// Time each `open` call spends before succeeding or failing.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.control.open_delay.lock() = delay;
    }

    /// Liveness reported by `ping` on every handle.
    pub fn set_healthy(&self, healthy: bool) {
        self.control.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Time each `execute` call spends inside the engine.
    pub fn set_delay(&self, delay: Duration) {
        *self.control.delay.lock() = delay;
    }

    /// Fail the next `execute` call with `error`. Calls queue up.
    pub fn fail_next(&self, error: EngineError) {
        self.control.failures.lock().push_back(error);
    }

    /// Query texts that reached the engine, in arrival order. Probes excluded.
    pub fn executed(&self) -> Vec<String> {
        self.control.executed.lock().clone()
    }

    /// Highest number of `execute` calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.control.peak.load(Ordering::SeqCst)
    }
}

impl GraphEngine for MockEngine {
    fn open(&self, _database: &Path) -> Result<Box<dyn EngineConnection>, EngineError> {
        let delay = *self.control.open_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(err) = self.control.open_failures.lock().pop_front() {
            return Err(err);
        }
        self.control.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            control: Arc::clone(&self.control),
        }))
    }
}

#[derive(Debug)]
struct MockConnection {
    control: Arc<Control>,
}

impl EngineConnection for MockConnection {
    fn execute(&mut self, query: &str) -> Result<Vec<Row>, EngineError> {
        if query == PING_QUERY {
            return if self.control.healthy.load(Ordering::SeqCst) {
                Ok(Vec::new())
            } else {
                Err(EngineError::connection("mock handle is down"))
            };
        }

        let active = self.control.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.control.peak.fetch_max(active, Ordering::SeqCst);

        let delay = *self.control.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.control.executed.lock().push(query.to_string());
        let failure = self.control.failures.lock().pop_front();

        self.control.active.fetch_sub(1, Ordering::SeqCst);

        match failure {
            Some(err) => Err(err),
            None => {
                let mut row = Row::new();
                row.insert("query".to_string(), query.into());
                Ok(vec![row])
            }
        }
    }

    fn close(&mut self) {
        self.control.closes.fetch_add(1, Ordering::SeqCst);
    }
}
