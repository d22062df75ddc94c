//! Worker pool lifecycle and pool-size control.

mod controller;
mod worker_pool;

pub use controller::{
    ControllerConfig, MetricFn, PoolSizeController, SizingSnapshot, StageRegistration,
    ThroughputFn,
};
pub use worker_pool::{
    DispatchRoutine, PoolError, PoolState, WakeFn, WorkerHandle, WorkerPool, WorkerPoolConfig,
};
