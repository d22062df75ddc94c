//! Staged event-driven runtime: bounded transactional queues, elastic
//! worker pools, and a shared pool-size controller.
//!
//! An application is decomposed into named stages. Each [`Stage`] owns a
//! [`BoundedQueue`] of events, a [`WorkerPool`] of dispatch threads, and
//! an [`EventHandler`] with the business logic. Producers enqueue into a
//! stage; its workers claim batches and run the handler. The
//! [`StageRuntime`] ties stages to one shared [`PoolSizeController`] that
//! grows pools under load and, optionally, hill-climbs toward the
//! throughput-optimal size.
//!
//! ```no_run
//! use stage_runtime::{Stage, StageRuntime};
//! use stage_runtime::stage::{EventHandler, HandlerError};
//!
//! struct Printer;
//!
//! impl EventHandler for Printer {
//!     type Event = String;
//!
//!     fn handle_events(&self, batch: &mut Vec<String>) -> Result<(), HandlerError> {
//!         for line in batch.drain(..) {
//!             println!("{line}");
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = StageRuntime::from_env();
//!     runtime.start()?;
//!     let stage = Stage::new(&runtime, runtime.stage_config("printer"), Printer);
//!     stage.init()?;
//!     stage.start()?;
//!     stage.queue().enqueue("hello".to_string()).map_err(|_| "queue full")?;
//!     stage.stop()?;
//!     stage.destroy()?;
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod pool;
pub mod queue;
pub mod stage;
pub mod telemetry;

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

pub use pool::{ControllerConfig, PoolSizeController, WorkerPool, WorkerPoolConfig};
pub use queue::{BoundedQueue, EnqueueError, Transaction, TransactionError};
pub use stage::{EventHandler, HandlerError, Stage, StageConfig, StageError};

use stage::{NullProfiler, ProfilerSink};

/// Top-level runtime configuration: controller tuning plus the template
/// applied to stages built through [`StageRuntime::stage_config`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    /// Template for new stages; `stage_config` clones it and fills in the
    /// stage name.
    pub stage: StageConfig,
}

/// Shared services handed to every stage: the pool-size controller and
/// the profiler sink. One per application; stages borrow it at
/// construction and keep clones of what they need.
pub struct StageRuntime {
    config: RuntimeConfig,
    controller: PoolSizeController,
    profiler: Arc<dyn ProfilerSink>,
    controller_thread: Mutex<Option<JoinHandle<()>>>,
}

impl StageRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_profiler(config, Arc::new(NullProfiler))
    }

    pub fn with_profiler(config: RuntimeConfig, profiler: Arc<dyn ProfilerSink>) -> Self {
        let controller = PoolSizeController::new(config.controller.clone());
        Self {
            config,
            controller,
            profiler,
            controller_thread: Mutex::new(None),
        }
    }

    /// Build from `STAGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(config::load())
    }

    /// Start the background sizing loop. Idempotent; a second call while
    /// the loop is running does nothing.
    pub fn start(&self) -> std::io::Result<()> {
        let mut guard = self.controller_thread.lock();
        if guard.is_none() {
            *guard = Some(self.controller.spawn()?);
            tracing::info!("stage runtime started");
        }
        Ok(())
    }

    /// Stop the sizing loop and join it. Stages are stopped by their
    /// owners; the runtime only tears down what it started.
    pub fn shutdown(&self) {
        self.controller.shutdown();
        let handle = self.controller_thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("pool-size controller thread panicked");
            }
            tracing::info!("stage runtime stopped");
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn controller(&self) -> &PoolSizeController {
        &self.controller
    }

    pub fn profiler(&self) -> &Arc<dyn ProfilerSink> {
        &self.profiler
    }

    /// The stage template with `name` filled in for both the stage and
    /// its pool.
    pub fn stage_config(&self, name: &str) -> StageConfig {
        let mut config = self.config.stage.clone();
        config.name = name.to_string();
        config.pool.name = name.to_string();
        config
    }
}

impl Drop for StageRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
