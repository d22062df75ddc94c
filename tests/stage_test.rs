//! End-to-end stage behavior: events flow from producers through the
//! queue and worker pool into the handler, with batching, admission
//! control, and lifecycle management on top.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stage_runtime::stage::{
    EventHandler, FixedThrottle, HandlerError, MetricsProfiler, ThrottledBatchSorter,
};
use stage_runtime::{RuntimeConfig, Stage, StageConfig, StageRuntime, WorkerPoolConfig};

struct RecordingHandler {
    events: AtomicU64,
    max_batch: AtomicUsize,
    inits: AtomicU64,
    destroys: AtomicU64,
}

impl RecordingHandler {
    fn new() -> Self {
        Self {
            events: AtomicU64::new(0),
            max_batch: AtomicUsize::new(0),
            inits: AtomicU64::new(0),
            destroys: AtomicU64::new(0),
        }
    }
}

impl EventHandler for RecordingHandler {
    type Event = u64;

    fn init(&self, _config: &StageConfig) -> Result<(), HandlerError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn handle_events(&self, batch: &mut Vec<u64>) -> Result<(), HandlerError> {
        self.max_batch.fetch_max(batch.len(), Ordering::SeqCst);
        self.events.fetch_add(batch.len() as u64, Ordering::SeqCst);
        batch.clear();
        // Simulated per-batch service time.
        thread::sleep(Duration::from_micros(100));
        Ok(())
    }

    fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_stage_config(runtime: &StageRuntime, name: &str) -> StageConfig {
    let mut config = runtime.stage_config(name);
    config.queue_capacity = 256;
    config.shutdown_timeout = Duration::from_secs(5);
    config.pool = WorkerPoolConfig {
        name: name.to_string(),
        block_time: Duration::from_millis(20),
        idle_timeout: Duration::from_secs(60),
        ..WorkerPoolConfig::default()
    };
    config
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn events_flow_from_producers_to_handler() {
    let runtime = StageRuntime::new(RuntimeConfig::default());
    let stage = Stage::new(&runtime, test_stage_config(&runtime, "flow"), RecordingHandler::new());
    stage.init().unwrap();
    stage.start().unwrap();

    let mut producers = Vec::new();
    for p in 0..4u64 {
        let queue = stage.queue().clone();
        producers.push(thread::spawn(move || {
            for i in 0..100 {
                queue.blocking_enqueue(p * 100 + i, Some(Duration::from_secs(5))).unwrap();
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        stage.stats().events_processed == 400
    }));
    let stats = stage.stats();
    assert_eq!(stats.events_processed, 400);
    assert_eq!(stats.handler_failures, 0);
    assert!(stats.batches_processed >= 1);
    assert!(stats.service_rate > 0.0);

    stage.stop().unwrap();
    stage.destroy().unwrap();
}

#[test]
fn throttled_sorter_caps_batch_size() {
    let runtime = StageRuntime::new(RuntimeConfig::default());
    let handler = Arc::new(RecordingHandler::new());

    struct SharedHandler(Arc<RecordingHandler>);

    impl EventHandler for SharedHandler {
        type Event = u64;

        fn handle_events(&self, batch: &mut Vec<u64>) -> Result<(), HandlerError> {
            self.0.handle_events(batch)
        }
    }

    let stage = Stage::new(
        &runtime,
        test_stage_config(&runtime, "throttled"),
        SharedHandler(handler.clone()),
    )
    .with_sorter(Arc::new(ThrottledBatchSorter::new(Arc::new(FixedThrottle(8)))));
    stage.init().unwrap();
    stage.start().unwrap();

    for i in 0..200u64 {
        stage.queue().blocking_enqueue(i, Some(Duration::from_secs(5))).unwrap();
    }
    assert!(wait_until(Duration::from_secs(10), || {
        handler.events.load(Ordering::SeqCst) == 200
    }));
    assert!(
        handler.max_batch.load(Ordering::SeqCst) <= 8,
        "batches must honor the aggregation target"
    );

    stage.stop().unwrap();
    stage.destroy().unwrap();
}

#[test]
fn admission_threshold_sheds_load_at_depth() {
    let runtime = StageRuntime::new(RuntimeConfig::default());
    let mut config = test_stage_config(&runtime, "shedding");
    config.admission_threshold = 4;
    // Never started: events pile up at the admission threshold.
    let stage = Stage::new(&runtime, config, RecordingHandler::new());
    stage.init().unwrap();

    let mut accepted = 0;
    for i in 0..10u64 {
        if stage.queue().enqueue_lossy(i) {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 4);
    assert!(stage.admission().is_some());

    // A response-time controller can retarget the threshold live.
    stage.admission().unwrap().set_threshold(6);
    assert!(stage.queue().enqueue_lossy(100));

    stage.destroy().unwrap();
}

#[test]
fn handler_lifecycle_hooks_run_once() {
    let runtime = StageRuntime::new(RuntimeConfig::default());
    let handler = Arc::new(RecordingHandler::new());

    struct SharedHandler(Arc<RecordingHandler>);

    impl EventHandler for SharedHandler {
        type Event = u64;

        fn init(&self, config: &StageConfig) -> Result<(), HandlerError> {
            self.0.init(config)
        }

        fn handle_events(&self, batch: &mut Vec<u64>) -> Result<(), HandlerError> {
            self.0.handle_events(batch)
        }

        fn destroy(&self) {
            self.0.destroy()
        }
    }

    let stage = Stage::new(
        &runtime,
        test_stage_config(&runtime, "hooks"),
        SharedHandler(handler.clone()),
    );
    stage.init().unwrap();
    stage.start().unwrap();
    stage.stop().unwrap();
    stage.start().unwrap();
    stage.stop().unwrap();
    stage.destroy().unwrap();

    assert_eq!(handler.inits.load(Ordering::SeqCst), 1);
    assert_eq!(handler.destroys.load(Ordering::SeqCst), 1);
}

#[test]
fn profiler_sees_stage_queue_depth() {
    let profiler = Arc::new(MetricsProfiler::new());
    let runtime = StageRuntime::with_profiler(RuntimeConfig::default(), profiler.clone());
    let mut config = test_stage_config(&runtime, "profiled");
    config.pool.initial_threads = 1;
    let stage = Stage::new(&runtime, config, RecordingHandler::new());
    stage.init().unwrap();

    // Publishing polls the registered queue-depth source; it must not
    // panic whether or not a metrics recorder is installed.
    stage.queue().enqueue(1).unwrap();
    profiler.publish();

    stage.destroy().unwrap();
}

#[test]
fn runtime_grows_stage_under_sustained_load() {
    let mut runtime_config = RuntimeConfig::default();
    runtime_config.controller.controller_delay = Duration::from_millis(10);
    let runtime = StageRuntime::new(runtime_config);
    runtime.start().unwrap();

    struct SlowHandler;

    impl EventHandler for SlowHandler {
        type Event = u64;

        fn handle_events(&self, batch: &mut Vec<u64>) -> Result<(), HandlerError> {
            batch.clear();
            thread::sleep(Duration::from_millis(10));
            Ok(())
        }
    }

    let mut config = test_stage_config(&runtime, "growing");
    config.pool_threshold = 4;
    config.pool.max_threads = Some(3);
    let stage = Stage::new(&runtime, config, SlowHandler);
    stage.init().unwrap();
    stage.start().unwrap();
    assert_eq!(stage.num_threads(), 1);

    let stop_feeding = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let feeder = {
        let queue = stage.queue().clone();
        let stop_feeding = stop_feeding.clone();
        thread::spawn(move || {
            let mut i = 0u64;
            while !stop_feeding.load(Ordering::Relaxed) {
                let _ = queue.enqueue_lossy(i);
                i += 1;
                thread::sleep(Duration::from_micros(200));
            }
        })
    };

    assert!(wait_until(Duration::from_secs(10), || stage.num_threads() == 3));

    stop_feeding.store(true, Ordering::Relaxed);
    feeder.join().unwrap();
    stage.stop().unwrap();
    stage.destroy().unwrap();
    runtime.shutdown();
}
