//! Collaborator interfaces a stage is wired to: the event handler itself,
//! plus the pluggable response-time, batching, and profiling hooks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::stage::StageConfig;
use crate::telemetry;

/// Failure reported by [`EventHandler::handle_events`]. Logged and the
/// dispatch loop continues, unless the pool's crash-on-failure policy is
/// set.
#[derive(Debug)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self { message: message.to_string() }
    }
}

/// A stage's business logic. One handler instance serves every worker
/// thread of the stage concurrently.
pub trait EventHandler: Send + Sync + 'static {
    type Event: Send + 'static;

    fn init(&self, _config: &StageConfig) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Process one batch. The handler drains the batch it is given; the
    /// dispatch loop clears and reuses the buffer afterwards.
    fn handle_events(&self, batch: &mut Vec<Self::Event>) -> Result<(), HandlerError>;

    fn destroy(&self) {}
}

/// Feedback loop adjusting a stage's admission threshold toward a latency
/// goal. The concrete arithmetic (direct, M/M/1, PID, multiclass) is a
/// strategy choice; the stage only forwards measurements.
pub trait ResponseTimeController: Send + Sync {
    fn adjust_threshold(&self, batch_len: usize, elapsed: Duration);
}

/// Source of the recommended batch size for the current load, consumed by
/// the throttled batch sorter. `None` means unbounded: drain everything.
pub trait AggregationThrottle: Send + Sync {
    fn agg_target(&self) -> Option<usize>;
}

/// Throttle with a fixed target; useful for tests and simple stages.
pub struct FixedThrottle(pub usize);

impl AggregationThrottle for FixedThrottle {
    fn agg_target(&self) -> Option<usize> {
        Some(self.0)
    }
}

/// Closure sampling a stage-level size (queue depth by default).
pub type SizeFn = Box<dyn Fn() -> usize + Send + Sync>;

/// Stats/metric export point. The core only registers and removes
/// sources; what a profiler does with them is its own business.
pub trait ProfilerSink: Send + Sync {
    fn add(&self, name: &str, size: SizeFn);
    fn remove(&self, name: &str);
}

/// Discards everything.
pub struct NullProfiler;

impl ProfilerSink for NullProfiler {
    fn add(&self, _name: &str, _size: SizeFn) {}
    fn remove(&self, _name: &str) {}
}

/// Publishes registered sources as gauges through the metrics facade.
/// Sources are polled on [`publish`](Self::publish), typically from the
/// application's own sampling loop.
#[derive(Default)]
pub struct MetricsProfiler {
    sources: Mutex<HashMap<String, SizeFn>>,
}

impl MetricsProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self) {
        for (name, size) in self.sources.lock().iter() {
            telemetry::record_queue_depth(name, size());
        }
    }
}

impl ProfilerSink for MetricsProfiler {
    fn add(&self, name: &str, size: SizeFn) {
        self.sources.lock().insert(name.to_string(), size);
    }

    fn remove(&self, name: &str) {
        self.sources.lock().remove(name);
    }
}

/// Response-time controller retargeting a [`ThresholdPredicate`] directly:
/// raises the admission threshold while batches complete under the target
/// latency and lowers it when they run over.
///
/// [`ThresholdPredicate`]: crate::queue::ThresholdPredicate
pub struct DirectResponseTimeController {
    predicate: Arc<crate::queue::ThresholdPredicate>,
    target: Duration,
    min_threshold: usize,
    max_threshold: usize,
}

impl DirectResponseTimeController {
    pub fn new(
        predicate: Arc<crate::queue::ThresholdPredicate>,
        target: Duration,
        min_threshold: usize,
        max_threshold: usize,
    ) -> Self {
        Self { predicate, target, min_threshold, max_threshold }
    }
}

impl ResponseTimeController for DirectResponseTimeController {
    fn adjust_threshold(&self, batch_len: usize, elapsed: Duration) {
        if batch_len == 0 {
            return;
        }
        let current = self.predicate.threshold();
        let next = if elapsed > self.target {
            current.saturating_sub(1).max(self.min_threshold)
        } else {
            (current + 1).min(self.max_threshold)
        };
        if next != current {
            self.predicate.set_threshold(next);
        }
    }
}
