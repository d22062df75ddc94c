//! Stage composition and lifecycle.
//!
//! A stage ties one queue, one worker pool, one batch sorter, and one
//! handler together under a name, and brackets them with the
//! program/init/start/stop/destroy lifecycle driven by the runtime owner.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::pool::{
    PoolError, PoolSizeController, StageRegistration, WorkerPool, WorkerPoolConfig,
};
use crate::queue::{BoundedQueue, ThresholdPredicate};
use crate::StageRuntime;

use super::dispatch::StageDispatchLoop;
use super::handler::{EventHandler, HandlerError, ResponseTimeController};
use super::sorter::{BatchSorter, NullBatchSorter};
use super::stats::{StageStats, StatsSnapshot};

/// Per-stage configuration.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub name: String,
    pub queue_capacity: usize,
    /// Admission threshold for the queue predicate; 0 disables admission
    /// control entirely.
    pub admission_threshold: usize,
    /// Queue depth at which the size controller adds a worker.
    pub pool_threshold: usize,
    pub auto_max_detect: bool,
    /// How long `stop()` waits for the pool to drain.
    pub shutdown_timeout: Duration,
    pub pool: WorkerPoolConfig,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: "stage".to_string(),
            queue_capacity: 1024,
            admission_threshold: 0,
            pool_threshold: 8,
            auto_max_detect: false,
            shutdown_timeout: Duration::from_secs(30),
            pool: WorkerPoolConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("invalid lifecycle transition: stage is {actual}, expected {expected}")]
    Lifecycle {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("stage did not drain within the shutdown timeout")]
    ShutdownTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Programmed,
    Initialized,
    Started,
    Stopped,
    Destroyed,
}

impl Lifecycle {
    fn name(self) -> &'static str {
        match self {
            Self::Programmed => "programmed",
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        }
    }
}

struct StageState {
    lifecycle: Lifecycle,
    pool: Option<WorkerPool>,
}

/// A named unit combining a bounded queue, a worker pool, and an event
/// handler. The queue outlives pool restarts: `stop()` then `start()`
/// resumes service on the same queue contents.
pub struct Stage<H: EventHandler> {
    config: StageConfig,
    runtime_controller: PoolSizeController,
    profiler: Arc<dyn super::handler::ProfilerSink>,
    queue: BoundedQueue<H::Event>,
    predicate: Option<Arc<ThresholdPredicate>>,
    handler: Arc<H>,
    sorter: Arc<dyn BatchSorter<H::Event>>,
    response_controller: Option<Arc<dyn ResponseTimeController>>,
    stats: Arc<StageStats>,
    state: Mutex<StageState>,
}

impl<H: EventHandler> Stage<H> {
    /// Program a stage: allocate its queue and record its wiring. No
    /// threads run until `start()`.
    pub fn new(runtime: &StageRuntime, config: StageConfig, handler: H) -> Self {
        let predicate = if config.admission_threshold > 0 {
            Some(Arc::new(ThresholdPredicate::new(config.admission_threshold)))
        } else {
            None
        };
        let queue = match &predicate {
            Some(p) => BoundedQueue::with_predicate(config.queue_capacity, p.clone()),
            None => BoundedQueue::new(config.queue_capacity),
        };
        Self {
            runtime_controller: runtime.controller().clone(),
            profiler: runtime.profiler().clone(),
            queue,
            predicate,
            handler: Arc::new(handler),
            sorter: Arc::new(NullBatchSorter),
            response_controller: None,
            stats: Arc::new(StageStats::new()),
            state: Mutex::new(StageState { lifecycle: Lifecycle::Programmed, pool: None }),
            config,
        }
    }

    /// Replace the default drain-all sorter. Call before `start()`.
    pub fn with_sorter(mut self, sorter: Arc<dyn BatchSorter<H::Event>>) -> Self {
        self.sorter = sorter;
        self
    }

    /// Attach a response-time controller. Call before `start()`.
    pub fn with_response_controller(mut self, rtc: Arc<dyn ResponseTimeController>) -> Self {
        self.response_controller = Some(rtc);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn queue(&self) -> &BoundedQueue<H::Event> {
        &self.queue
    }

    /// The stage's admission predicate, when admission control is on.
    pub fn admission(&self) -> Option<&Arc<ThresholdPredicate>> {
        self.predicate.as_ref()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn num_threads(&self) -> usize {
        self.state.lock().pool.as_ref().map_or(0, WorkerPool::num_threads)
    }

    /// Initialize the handler and register the queue with the profiler.
    pub fn init(&self) -> Result<(), StageError> {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Programmed {
            return Err(StageError::Lifecycle {
                expected: "programmed",
                actual: state.lifecycle.name(),
            });
        }
        self.handler.init(&self.config)?;
        let queue = self.queue.clone();
        self.profiler
            .add(&self.config.name, Box::new(move || queue.len()));
        state.lifecycle = Lifecycle::Initialized;
        tracing::info!(stage = %self.config.name, "stage initialized");
        Ok(())
    }

    /// Start (or restart) the worker pool and register with the size
    /// controller. At most once without an intervening `stop()`.
    pub fn start(&self) -> Result<(), StageError> {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Initialized | Lifecycle::Stopped => {}
            other => {
                return Err(StageError::Lifecycle {
                    expected: "initialized or stopped",
                    actual: other.name(),
                });
            }
        }
        let pool = match &state.pool {
            Some(pool) => pool.clone(),
            None => {
                let mut pool_config = self.config.pool.clone();
                pool_config.name = self.config.name.clone();
                let routine = StageDispatchLoop::new(
                    self.config.name.clone(),
                    self.queue.clone(),
                    self.sorter.clone(),
                    self.handler.clone(),
                    self.stats.clone(),
                    self.response_controller.clone(),
                );
                let pool = WorkerPool::new(pool_config, Arc::new(routine));
                let queue = self.queue.clone();
                pool.set_wake(Arc::new(move || queue.notify_consumers()));
                state.pool = Some(pool.clone());
                pool
            }
        };
        pool.start()?;

        let queue = self.queue.clone();
        let stats = self.stats.clone();
        self.runtime_controller.register(StageRegistration {
            name: self.config.name.clone(),
            pool: pool.clone(),
            metric: Box::new(move || queue.len()),
            threshold: self.config.pool_threshold,
            throughput: Box::new(move || stats.events_processed()),
            auto_max: self.config.auto_max_detect,
        });
        state.lifecycle = Lifecycle::Started;
        tracing::info!(
            stage = %self.config.name,
            threads = pool.num_threads(),
            "stage started",
        );
        Ok(())
    }

    /// Stop the pool gracefully and wait out the shutdown timeout. The
    /// queue stays open and keeps its contents for a later restart.
    pub fn stop(&self) -> Result<(), StageError> {
        let state = self.state.lock();
        let pool = match (&state.lifecycle, &state.pool) {
            (Lifecycle::Started, Some(pool)) => pool.clone(),
            _ => {
                return Err(StageError::Lifecycle {
                    expected: "started",
                    actual: state.lifecycle.name(),
                });
            }
        };
        drop(state);

        self.runtime_controller.unregister(&self.config.name);
        pool.stop();
        let drained = pool.await_termination(Some(self.config.shutdown_timeout));
        if !drained {
            tracing::warn!(stage = %self.config.name, "graceful stop timed out, forcing");
            pool.stop_now();
            if !pool.await_termination(Some(self.config.shutdown_timeout)) {
                return Err(StageError::ShutdownTimeout);
            }
        }

        let mut state = self.state.lock();
        state.lifecycle = Lifecycle::Stopped;
        tracing::info!(stage = %self.config.name, "stage stopped");
        Ok(())
    }

    /// Tear the stage down: destroy the handler, deregister from the
    /// profiler, and close the queue.
    pub fn destroy(&self) -> Result<(), StageError> {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Initialized | Lifecycle::Stopped => {}
            other => {
                return Err(StageError::Lifecycle {
                    expected: "initialized or stopped",
                    actual: other.name(),
                });
            }
        }
        self.handler.destroy();
        self.profiler.remove(&self.config.name);
        self.queue.close();
        state.lifecycle = Lifecycle::Destroyed;
        tracing::info!(stage = %self.config.name, "stage destroyed");
        Ok(())
    }
}
