//! Stage composition: handler contracts, batch sorting, the dispatch
//! loop, statistics, and the stage lifecycle.

mod dispatch;
mod handler;
mod sorter;
mod stage;
mod stats;

pub use dispatch::StageDispatchLoop;
pub use handler::{
    AggregationThrottle, DirectResponseTimeController, EventHandler, FixedThrottle,
    HandlerError, MetricsProfiler, NullProfiler, ProfilerSink, ResponseTimeController, SizeFn,
};
pub use sorter::{BatchSorter, NullBatchSorter, ThrottledBatchSorter};
pub use stage::{Stage, StageConfig, StageError};
pub use stats::{StageStats, StatsSnapshot};
