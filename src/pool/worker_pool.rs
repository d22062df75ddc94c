//! Worker thread pool with dynamic sizing and a three-state shutdown
//! protocol.
//!
//! Workers are real OS threads, each running the pool's dispatch routine.
//! The pool owns all worker bookkeeping: a worker's own exit path only
//! reports completion, and removal always happens under the pool lock.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Callback used to wake blocked workers during forced shutdown
/// (typically the stage queue's `notify_consumers`).
pub type WakeFn = Arc<dyn Fn() + Send + Sync>;

/// The per-worker loop executed by every thread in the pool.
pub trait DispatchRoutine: Send + Sync + 'static {
    /// Run until [`WorkerHandle::should_exit`] reports true or the routine
    /// negotiates an idle exit.
    fn dispatch(&self, worker: &WorkerHandle);
}

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Running,
    Stopping,
    Terminated,
}

/// Configuration for a stage's worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Thread name prefix and log identity.
    pub name: String,
    /// Never shrink below this many workers.
    pub min_threads: usize,
    /// Ceiling for growth; `None` = unbounded.
    pub max_threads: Option<usize>,
    /// Workers spawned at start (0 = one per CPU).
    pub initial_threads: usize,
    /// How long a worker blocks on the queue per dispatch cycle.
    pub block_time: Duration,
    /// Accumulated idle time after which a worker may volunteer to exit.
    pub idle_timeout: Duration,
    /// Escalate handler failures to process termination.
    pub crash_on_failure: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "stage".to_string(),
            min_threads: 1,
            max_threads: None,
            initial_threads: 1,
            block_time: Duration::from_millis(1000),
            idle_timeout: Duration::from_millis(5000),
            crash_on_failure: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is not running")]
    NotRunning,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Worker threads are detached; termination is tracked through this
/// bookkeeping and the `term` condvar, not by joining handles.
struct WorkerSlot {
    stop: Arc<AtomicBool>,
    /// Set when the pool has sanctioned this worker's exit; an exit
    /// without it (while running) is a detected bug.
    exit_approved: bool,
}

struct PoolInner {
    state: PoolState,
    /// Bumped on every restart; lets `await_termination` detect a restart.
    epoch: u64,
    next_id: u64,
    active: HashMap<u64, WorkerSlot>,
    stopping: HashMap<u64, WorkerSlot>,
}

impl PoolInner {
    /// Active workers that have not been approved for exit; the
    /// `min_threads` floor is measured against this count.
    fn remaining_threads(&self) -> usize {
        self.active.values().filter(|s| !s.exit_approved).count()
    }
}

struct PoolShared {
    config: WorkerPoolConfig,
    routine: Arc<dyn DispatchRoutine>,
    inner: Mutex<PoolInner>,
    term: Condvar,
    /// Mirrors `state != Running` so workers can poll without the lock.
    stop_all: AtomicBool,
    wake: Mutex<Option<WakeFn>>,
}

impl PoolShared {
    fn worker_exited(&self, id: u64) {
        let mut inner = self.inner.lock();
        let slot = match inner.active.remove(&id) {
            Some(slot) => {
                if !slot.exit_approved && inner.state == PoolState::Running {
                    tracing::error!(
                        pool = %self.config.name,
                        worker = id,
                        "worker exited without being asked to stop; repairing bookkeeping",
                    );
                }
                Some(slot)
            }
            None => inner.stopping.remove(&id),
        };
        drop(slot);
        if inner.state == PoolState::Stopping
            && inner.active.is_empty()
            && inner.stopping.is_empty()
        {
            inner.state = PoolState::Terminated;
            tracing::debug!(pool = %self.config.name, "all workers exited, pool terminated");
            drop(inner);
            self.term.notify_all();
        }
    }

    fn wake_workers(&self) {
        if let Some(wake) = self.wake.lock().as_ref() {
            wake();
        }
    }
}

/// Named set of worker threads serving one stage. Cloning yields another
/// handle to the same pool.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, routine: Arc<dyn DispatchRoutine>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                routine,
                inner: Mutex::new(PoolInner {
                    state: PoolState::Terminated,
                    epoch: 0,
                    next_id: 0,
                    active: HashMap::new(),
                    stopping: HashMap::new(),
                }),
                term: Condvar::new(),
                stop_all: AtomicBool::new(true),
                wake: Mutex::new(None),
            }),
        }
    }

    /// Install the wake callback used by [`stop_now`](Self::stop_now) to
    /// unblock workers waiting on the stage queue.
    pub fn set_wake(&self, wake: WakeFn) {
        *self.shared.wake.lock() = Some(wake);
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    pub fn state(&self) -> PoolState {
        self.shared.inner.lock().state
    }

    /// Current worker count (active plus still-draining).
    pub fn num_threads(&self) -> usize {
        let inner = self.shared.inner.lock();
        inner.active.len() + inner.stopping.len()
    }

    /// Spawn the initial workers and transition to `Running`. Idempotent
    /// while running; a restart mid-shutdown reclaims the draining workers
    /// and cancels outstanding termination waits.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            PoolState::Running => return Ok(()),
            PoolState::Stopping => {
                inner.state = PoolState::Running;
                inner.epoch += 1;
                // Reclaim draining workers. Some may already have observed
                // the stop and be on their way out; their exits stay
                // sanctioned and start() tops the pool back up.
                let stopping = std::mem::take(&mut inner.stopping);
                for (id, mut slot) in stopping {
                    slot.exit_approved = true;
                    inner.active.insert(id, slot);
                }
                tracing::info!(pool = %self.shared.config.name, "pool restarted mid-shutdown");
            }
            PoolState::Terminated => {
                inner.state = PoolState::Running;
                inner.epoch += 1;
            }
        }
        self.shared.stop_all.store(false, Ordering::Release);
        let target = self.initial_threads();
        while inner.active.len() < target {
            self.spawn_worker(&mut inner)?;
        }
        drop(inner);
        // Cancel any await_termination in flight.
        self.shared.term.notify_all();
        Ok(())
    }

    /// Request cooperative shutdown: workers observe the stop at their next
    /// dispatch-cycle check and exit after finishing their current batch.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.state != PoolState::Running {
            return;
        }
        inner.state = PoolState::Stopping;
        self.shared.stop_all.store(true, Ordering::Release);
        let active = std::mem::take(&mut inner.active);
        for (id, mut slot) in active {
            slot.exit_approved = true;
            inner.stopping.insert(id, slot);
        }
        tracing::info!(
            pool = %self.shared.config.name,
            workers = inner.stopping.len(),
            "pool stopping",
        );
        if inner.stopping.is_empty() {
            inner.state = PoolState::Terminated;
            drop(inner);
            self.shared.term.notify_all();
        }
    }

    /// Like [`stop`](Self::stop), but also cancels blocked waits so
    /// workers observe the stop without waiting out their block time.
    pub fn stop_now(&self) {
        self.stop();
        let mut inner = self.shared.inner.lock();
        for slot in inner.stopping.values_mut() {
            slot.stop.store(true, Ordering::Release);
        }
        drop(inner);
        self.shared.wake_workers();
    }

    /// Block until the pool is `Terminated` or the timeout elapses.
    /// Returns false on timeout or if the pool was restarted while waiting.
    pub fn await_termination(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.shared.inner.lock();
        let epoch = inner.epoch;
        loop {
            if inner.state == PoolState::Terminated {
                return true;
            }
            if inner.epoch != epoch {
                return false;
            }
            match deadline {
                None => self.shared.term.wait(&mut inner),
                Some(d) => {
                    if self.shared.term.wait_until(&mut inner, d).timed_out() {
                        return inner.state == PoolState::Terminated;
                    }
                }
            }
        }
    }

    /// Add up to `n` workers, clamped by `max_threads`. Returns the number
    /// actually spawned.
    pub fn add_threads(&self, n: usize) -> Result<usize, PoolError> {
        let mut inner = self.shared.inner.lock();
        if inner.state != PoolState::Running {
            return Err(PoolError::NotRunning);
        }
        let headroom = self
            .shared
            .config
            .max_threads
            .map_or(usize::MAX, |max| max.saturating_sub(inner.active.len()));
        let to_add = n.min(headroom);
        for _ in 0..to_add {
            self.spawn_worker(&mut inner)?;
        }
        Ok(to_add)
    }

    /// Mark up to `n` workers for voluntary exit, never dropping below
    /// `min_threads`. Returns the number marked.
    ///
    /// The floor is checked against workers whose exit is not already
    /// sanctioned; approved-but-not-yet-exited workers no longer count
    /// toward it, so repeated calls cannot overshoot.
    pub fn remove_threads(&self, n: usize) -> usize {
        let mut inner = self.shared.inner.lock();
        if inner.state != PoolState::Running {
            return 0;
        }
        let removable = inner
            .remaining_threads()
            .saturating_sub(self.shared.config.min_threads);
        let to_remove = n.min(removable);
        let victims: Vec<u64> = inner
            .active
            .iter()
            .filter(|(_, slot)| !slot.exit_approved)
            .map(|(id, _)| *id)
            .take(to_remove)
            .collect();
        let marked = victims.len();
        for id in victims {
            if let Some(slot) = inner.active.get_mut(&id) {
                slot.exit_approved = true;
                slot.stop.store(true, Ordering::Release);
            }
        }
        marked
    }

    fn initial_threads(&self) -> usize {
        let config = &self.shared.config;
        let initial = if config.initial_threads == 0 {
            num_cpus::get().max(1)
        } else {
            config.initial_threads
        };
        let initial = initial.max(config.min_threads);
        config.max_threads.map_or(initial, |max| initial.min(max))
    }

    fn spawn_worker(&self, inner: &mut PoolInner) -> Result<(), PoolError> {
        let id = inner.next_id;
        inner.next_id += 1;
        let stop = Arc::new(AtomicBool::new(false));
        let worker = WorkerHandle {
            shared: Arc::clone(&self.shared),
            id,
            stop: Arc::clone(&stop),
        };
        let name = format!("{}-{}", self.shared.config.name, id);
        thread::Builder::new().name(name).spawn(move || {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| worker.shared.routine.dispatch(&worker)));
            if result.is_err() {
                tracing::error!(
                    pool = %worker.shared.config.name,
                    worker = worker.id,
                    "dispatch routine panicked",
                );
            }
            worker.shared.worker_exited(worker.id);
        })?;
        inner.active.insert(id, WorkerSlot { stop, exit_approved: false });
        Ok(())
    }
}

/// Per-worker view of the pool, handed to the dispatch routine.
pub struct WorkerHandle {
    shared: Arc<PoolShared>,
    id: u64,
    stop: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool_name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn block_time(&self) -> Duration {
        self.shared.config.block_time
    }

    pub fn idle_timeout(&self) -> Duration {
        self.shared.config.idle_timeout
    }

    pub fn crash_on_failure(&self) -> bool {
        self.shared.config.crash_on_failure
    }

    /// True once this worker (or the whole pool) has been asked to stop.
    pub fn should_exit(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.shared.stop_all.load(Ordering::Acquire)
    }

    /// Ask the pool for permission to exit after prolonged idleness.
    /// Granted while stopping, or while more than `min_threads`
    /// unapproved workers remain; the exit stays the pool's decision, the
    /// worker only asks. Counting only unapproved workers keeps two
    /// simultaneously idle workers from both draining past the floor.
    pub fn request_exit_if_idle(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.state != PoolState::Running {
            return true;
        }
        match inner.active.get(&self.id) {
            // Already sanctioned (e.g. by remove_threads).
            Some(slot) if slot.exit_approved => return true,
            None => return true,
            Some(_) => {}
        }
        if inner.remaining_threads() > self.shared.config.min_threads {
            if let Some(slot) = inner.active.get_mut(&self.id) {
                slot.exit_approved = true;
            }
            tracing::debug!(
                pool = %self.shared.config.name,
                worker = self.id,
                "idle worker leaving pool",
            );
            return true;
        }
        false
    }
}
