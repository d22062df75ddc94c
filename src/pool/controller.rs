//! Pool sizing control loop.
//!
//! One controller is shared by every registered stage. Each tick it grows
//! pools whose load metric is over threshold; on a longer period it
//! smooths thread-count/throughput samples and, when auto-max-detect is
//! enabled, runs a stochastic hill-climbing step toward the
//! throughput-optimal pool size.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::worker_pool::{PoolError, WorkerPool};

/// Load metric sampled once per tick (defaults to queue depth).
pub type MetricFn = Box<dyn Fn() -> usize + Send>;
/// Cumulative event count; throughput is its rate of change.
pub type ThroughputFn = Box<dyn Fn() -> u64 + Send>;

/// Controller tuning. Intervals are in ticks of `controller_delay`.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub controller_delay: Duration,
    pub measurement_interval: u64,
    pub auto_max_interval: u64,
    pub smoothing_alpha: f64,
    /// Upper bound (exclusive) of the random perturbation subtracted from
    /// the saved-best size when reverting. Keeps the search exploring
    /// slightly below the last known-good point.
    pub random_jump: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_delay: Duration::from_millis(2000),
            measurement_interval: 1,
            auto_max_interval: 5,
            smoothing_alpha: 0.3,
            random_jump: 4,
        }
    }
}

/// One stage's registration with the controller.
pub struct StageRegistration {
    pub name: String,
    pub pool: WorkerPool,
    pub metric: MetricFn,
    /// Grow by one worker whenever `metric() >= threshold`.
    pub threshold: usize,
    pub throughput: ThroughputFn,
    pub auto_max: bool,
}

/// Smoothed sizing state, readable for profiling and tests.
#[derive(Debug, Clone, Serialize)]
pub struct SizingSnapshot {
    pub avg_threads: f64,
    pub avg_throughput: f64,
    pub saved_threads: usize,
    pub saved_throughput: f64,
}

struct SizingState {
    avg_threads: f64,
    avg_throughput: f64,
    saved_threads: usize,
    saved_throughput: f64,
    last_events: u64,
    last_sample: Instant,
}

struct Entry {
    reg: StageRegistration,
    state: SizingState,
}

struct CtlInner {
    entries: Vec<Entry>,
    tick: u64,
    rng: SmallRng,
}

struct CtlShared {
    config: ControllerConfig,
    inner: Mutex<CtlInner>,
    stop: AtomicBool,
}

/// Background pool-size controller shared across stages.
pub struct PoolSizeController {
    shared: Arc<CtlShared>,
}

impl Clone for PoolSizeController {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl PoolSizeController {
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_rng(config, SmallRng::from_entropy())
    }

    /// Construct with an explicit RNG so the hill-climb is deterministic
    /// under test.
    pub fn with_rng(config: ControllerConfig, rng: SmallRng) -> Self {
        Self {
            shared: Arc::new(CtlShared {
                config,
                inner: Mutex::new(CtlInner { entries: Vec::new(), tick: 0, rng }),
                stop: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    pub fn register(&self, reg: StageRegistration) {
        let now = Instant::now();
        let threads = reg.pool.num_threads();
        let events = (reg.throughput)();
        tracing::debug!(stage = %reg.name, threads, "stage registered with size controller");
        let entry = Entry {
            state: SizingState {
                avg_threads: threads as f64,
                avg_throughput: 0.0,
                saved_threads: threads.max(1),
                saved_throughput: 0.0,
                last_events: events,
                last_sample: now,
            },
            reg,
        };
        self.shared.inner.lock().entries.push(entry);
    }

    pub fn unregister(&self, name: &str) {
        self.shared.inner.lock().entries.retain(|e| e.reg.name != name);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.shared.inner.lock().entries.iter().any(|e| e.reg.name == name)
    }

    /// Smoothed sizing state for one stage.
    pub fn sizing(&self, name: &str) -> Option<SizingSnapshot> {
        let inner = self.shared.inner.lock();
        inner.entries.iter().find(|e| e.reg.name == name).map(|e| SizingSnapshot {
            avg_threads: e.state.avg_threads,
            avg_throughput: e.state.avg_throughput,
            saved_threads: e.state.saved_threads,
            saved_throughput: e.state.saved_throughput,
        })
    }

    /// One controller step. The background loop calls this every
    /// `controller_delay`; tests drive it directly for determinism.
    pub fn tick(&self) {
        let mut inner = self.shared.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let alpha = self.shared.config.smoothing_alpha;
        let measure = tick % self.shared.config.measurement_interval.max(1) == 0;
        let auto_max = tick % self.shared.config.auto_max_interval.max(1) == 0;

        let CtlInner { entries, rng, .. } = &mut *inner;
        for entry in entries.iter_mut() {
            // Reactive growth: one worker whenever the metric is over
            // threshold. Shrinking is left to idle timeouts and the
            // hill-climb.
            let metric = (entry.reg.metric)();
            if metric >= entry.reg.threshold {
                match entry.reg.pool.add_threads(1) {
                    Ok(added) if added > 0 => {
                        tracing::debug!(
                            stage = %entry.reg.name,
                            metric,
                            threads = entry.reg.pool.num_threads(),
                            "load over threshold, added worker",
                        );
                    }
                    Ok(_) => {}
                    Err(PoolError::NotRunning) => {}
                    Err(err) => {
                        tracing::warn!(stage = %entry.reg.name, error = %err, "failed to add worker");
                    }
                }
            }

            if measure {
                measure_entry(entry, alpha);
            }

            if auto_max && entry.reg.auto_max {
                auto_max_step(entry, rng, self.shared.config.random_jump);
            }
        }
    }

    /// Spawn the background loop. Stop it with
    /// [`shutdown`](Self::shutdown) and join the returned handle.
    pub fn spawn(&self) -> std::io::Result<thread::JoinHandle<()>> {
        let shared = Arc::clone(&self.shared);
        let controller = Self { shared };
        thread::Builder::new()
            .name("pool-size-controller".to_string())
            .spawn(move || {
                while !controller.shared.stop.load(Ordering::Acquire) {
                    controller.tick();
                    thread::sleep(controller.shared.config.controller_delay);
                }
            })
    }

    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

fn measure_entry(entry: &mut Entry, alpha: f64) {
    let now = Instant::now();
    let events = (entry.reg.throughput)();
    let dt = now.duration_since(entry.state.last_sample).as_secs_f64();
    if dt <= 0.0 {
        return;
    }
    let throughput = events.saturating_sub(entry.state.last_events) as f64 / dt;
    let threads = entry.reg.pool.num_threads();
    entry.state.avg_threads = alpha * threads as f64 + (1.0 - alpha) * entry.state.avg_threads;
    entry.state.avg_throughput = alpha * throughput + (1.0 - alpha) * entry.state.avg_throughput;
    entry.state.last_events = events;
    entry.state.last_sample = now;
    crate::telemetry::record_stage_throughput(&entry.reg.name, entry.state.avg_throughput);
    crate::telemetry::record_pool_size(&entry.reg.name, threads);
}

/// One stochastic hill-climbing step. Accept the current state when
/// throughput did not regress; otherwise revert toward the saved-best
/// size minus a random perturbation so the search keeps probing below
/// the last known-good point instead of oscillating.
fn auto_max_step(entry: &mut Entry, rng: &mut SmallRng, random_jump: usize) {
    let state = &mut entry.state;
    if state.avg_throughput >= state.saved_throughput {
        state.saved_threads = (state.avg_threads.round() as usize).max(1);
        state.saved_throughput = state.avg_throughput;
        tracing::debug!(
            stage = %entry.reg.name,
            saved_threads = state.saved_threads,
            saved_throughput = state.saved_throughput,
            "auto-max: accepted current state as best",
        );
    } else if state.avg_throughput <= 1.2 * state.saved_throughput {
        let jump = if random_jump > 0 { rng.gen_range(0..random_jump) } else { 0 };
        let target = state.saved_threads.saturating_sub(jump).max(1);
        let current = entry.reg.pool.num_threads();
        tracing::debug!(
            stage = %entry.reg.name,
            current,
            target,
            jump,
            "auto-max: reverting toward saved-best size",
        );
        if target > current {
            let _ = entry.reg.pool.add_threads(target - current);
        } else if current > target {
            entry.reg.pool.remove_threads(current - target);
        }
    }
}
