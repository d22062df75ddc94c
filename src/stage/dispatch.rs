//! Per-worker dispatch loop.
//!
//! One instance is shared by every worker thread of a stage; each thread
//! runs [`DispatchRoutine::dispatch`] with its own reused batch buffer.

use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pool::{DispatchRoutine, WorkerHandle};
use crate::queue::BoundedQueue;

use super::handler::{EventHandler, ResponseTimeController};
use super::sorter::BatchSorter;
use super::stats::StageStats;

pub struct StageDispatchLoop<H: EventHandler> {
    name: String,
    queue: BoundedQueue<H::Event>,
    sorter: Arc<dyn BatchSorter<H::Event>>,
    handler: Arc<H>,
    stats: Arc<StageStats>,
    response_controller: Option<Arc<dyn ResponseTimeController>>,
}

impl<H: EventHandler> StageDispatchLoop<H> {
    pub fn new(
        name: String,
        queue: BoundedQueue<H::Event>,
        sorter: Arc<dyn BatchSorter<H::Event>>,
        handler: Arc<H>,
        stats: Arc<StageStats>,
        response_controller: Option<Arc<dyn ResponseTimeController>>,
    ) -> Self {
        Self { name, queue, sorter, handler, stats, response_controller }
    }

    /// Run the handler over one batch, containing panics. Returns false
    /// on failure.
    fn handle_batch(&self, batch: &mut Vec<H::Event>) -> bool {
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle_events(batch)));
        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::error!(stage = %self.name, error = %err, "event handler failed");
                false
            }
            Err(_) => {
                tracing::error!(stage = %self.name, "event handler panicked");
                false
            }
        }
    }
}

impl<H: EventHandler> DispatchRoutine for StageDispatchLoop<H> {
    fn dispatch(&self, worker: &WorkerHandle) {
        let block_time = worker.block_time();
        let idle_limit = worker.idle_timeout();
        let mut batch: Vec<H::Event> = Vec::new();
        let mut idle = Duration::ZERO;

        loop {
            if worker.should_exit() {
                break;
            }

            batch.clear();
            let wait_start = Instant::now();
            let claimed = self
                .sorter
                .next_batch(&self.queue, &mut batch, Some(block_time));

            if claimed == 0 {
                idle += wait_start.elapsed();
                if idle >= idle_limit && worker.request_exit_if_idle() {
                    break;
                }
                continue;
            }
            idle = Duration::ZERO;

            let start = Instant::now();
            let ok = self.handle_batch(&mut batch);
            let elapsed = start.elapsed();

            if ok {
                self.stats.record_batch(claimed, elapsed);
                if let Some(rtc) = &self.response_controller {
                    rtc.adjust_threshold(claimed, elapsed);
                }
            } else {
                self.stats.record_failure();
                crate::telemetry::record_handler_failure(&self.name);
                if worker.crash_on_failure() {
                    tracing::error!(
                        stage = %self.name,
                        "crash-on-failure policy set, terminating process",
                    );
                    process::abort();
                }
            }
        }
    }
}
