//! Pool-size controller driven deterministically through `tick()`: load
//! growth, throughput measurement, and the auto-max hill climb.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::SeedableRng;

use stage_runtime::pool::{
    ControllerConfig, DispatchRoutine, PoolSizeController, StageRegistration, WorkerHandle,
    WorkerPool, WorkerPoolConfig,
};

struct ParkRoutine;

impl DispatchRoutine for ParkRoutine {
    fn dispatch(&self, worker: &WorkerHandle) {
        while !worker.should_exit() {
            thread::sleep(Duration::from_millis(2));
        }
    }
}

fn test_pool(min: usize, max: usize, initial: usize) -> WorkerPool {
    WorkerPool::new(
        WorkerPoolConfig {
            name: "ctl-pool".to_string(),
            min_threads: min,
            max_threads: Some(max),
            initial_threads: initial,
            block_time: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(60),
            crash_on_failure: false,
        },
        Arc::new(ParkRoutine),
    )
}

/// Deterministic controller: every tick measures and hill-climbs,
/// smoothing snaps to the latest sample, and `random_jump: 1` pins the
/// revert perturbation at zero.
fn deterministic_controller() -> PoolSizeController {
    PoolSizeController::with_rng(
        ControllerConfig {
            controller_delay: Duration::from_millis(1),
            measurement_interval: 1,
            auto_max_interval: 1,
            smoothing_alpha: 1.0,
            random_jump: 1,
        },
        SmallRng::seed_from_u64(42),
    )
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
fn sustained_load_grows_pool_one_worker_per_tick() {
    let pool = test_pool(1, 4, 1);
    pool.start().unwrap();
    let depth = Arc::new(AtomicUsize::new(100));
    let ctl = deterministic_controller();
    let depth_src = depth.clone();
    ctl.register(StageRegistration {
        name: "loaded".to_string(),
        pool: pool.clone(),
        metric: Box::new(move || depth_src.load(Ordering::Relaxed)),
        threshold: 8,
        throughput: Box::new(|| 0),
        auto_max: false,
    });

    for expected in 2..=4 {
        ctl.tick();
        assert_eq!(pool.num_threads(), expected);
        thread::sleep(Duration::from_millis(2));
    }
    ctl.tick();
    assert_eq!(pool.num_threads(), 4, "growth stops at max_threads");

    // Load falls under threshold: no further growth.
    depth.store(0, Ordering::Relaxed);
    ctl.tick();
    assert_eq!(pool.num_threads(), 4);

    pool.stop();
    assert!(pool.await_termination(Some(Duration::from_secs(5))));
}

#[test]
fn measurement_tracks_synthetic_throughput() {
    let pool = test_pool(1, 4, 2);
    pool.start().unwrap();
    let events = Arc::new(AtomicU64::new(0));
    let ctl = deterministic_controller();
    let events_src = events.clone();
    ctl.register(StageRegistration {
        name: "measured".to_string(),
        pool: pool.clone(),
        metric: Box::new(|| 0),
        threshold: usize::MAX,
        throughput: Box::new(move || events_src.load(Ordering::Relaxed)),
        auto_max: false,
    });

    events.store(500, Ordering::Relaxed);
    thread::sleep(Duration::from_millis(20));
    ctl.tick();

    let sizing = ctl.sizing("measured").unwrap();
    assert!(sizing.avg_throughput > 0.0);
    assert!((sizing.avg_threads - 2.0).abs() < f64::EPSILON);

    pool.stop();
    assert!(pool.await_termination(Some(Duration::from_secs(5))));
}

#[test]
fn auto_max_accepts_rising_throughput() {
    let pool = test_pool(1, 4, 1);
    pool.start().unwrap();
    let events = Arc::new(AtomicU64::new(0));
    let ctl = deterministic_controller();
    let events_src = events.clone();
    ctl.register(StageRegistration {
        name: "climber".to_string(),
        pool: pool.clone(),
        metric: Box::new(|| 100),
        threshold: 8,
        throughput: Box::new(move || events_src.load(Ordering::Relaxed)),
        auto_max: true,
    });

    // Each tick the pool gains a worker and the event rate rises
    // steeply, so every hill-climb step accepts the larger size.
    let mut delta = 200u64;
    for _ in 0..4 {
        events.fetch_add(delta, Ordering::Relaxed);
        delta *= 4;
        thread::sleep(Duration::from_millis(20));
        ctl.tick();
    }

    let sizing = ctl.sizing("climber").unwrap();
    assert_eq!(sizing.saved_threads, 4);
    assert!(sizing.saved_throughput > 0.0);
    assert_eq!(pool.num_threads(), 4);

    pool.stop();
    assert!(pool.await_termination(Some(Duration::from_secs(5))));
}

#[test]
fn auto_max_converges_to_throughput_optimum() {
    let pool = test_pool(1, 6, 1);
    pool.start().unwrap();
    let events = Arc::new(AtomicU64::new(0));
    let ctl = deterministic_controller();
    let events_src = events.clone();
    ctl.register(StageRegistration {
        name: "optimum".to_string(),
        pool: pool.clone(),
        metric: Box::new(|| 0),
        threshold: usize::MAX,
        throughput: Box::new(move || events_src.load(Ordering::Relaxed)),
        auto_max: true,
    });

    // Synthetic curve: each worker helps up to three, then contention
    // makes the rate fall off sharply.
    let rate = |threads: usize| -> u64 {
        if threads <= 3 {
            threads as u64 * 1000
        } else {
            1200
        }
    };

    // Climb: feed the interval's rate for the current size, then step up.
    for step in 0..3 {
        events.fetch_add(rate(pool.num_threads()), Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        ctl.tick();
        if step < 2 {
            pool.add_threads(1).unwrap();
        }
    }
    assert_eq!(ctl.sizing("optimum").unwrap().saved_threads, 3);

    // Probe a fourth worker twice: throughput drops, the climb reverts to
    // the saved best instead of drifting toward max_threads.
    for _ in 0..2 {
        pool.add_threads(1).unwrap();
        assert_eq!(pool.num_threads(), 4);
        events.fetch_add(rate(4), Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        ctl.tick();
        assert!(wait_until(Duration::from_secs(5), || pool.num_threads() == 3));
        let sizing = ctl.sizing("optimum").unwrap();
        assert_eq!(sizing.saved_threads, 3, "optimum must not drift toward max");
        assert!(sizing.saved_throughput > 0.0);
    }

    pool.stop();
    assert!(pool.await_termination(Some(Duration::from_secs(5))));
}

#[test]
fn auto_max_reverts_pool_when_throughput_collapses() {
    let pool = test_pool(1, 8, 2);
    pool.start().unwrap();
    let events = Arc::new(AtomicU64::new(0));
    let ctl = deterministic_controller();
    let events_src = events.clone();
    ctl.register(StageRegistration {
        name: "reverter".to_string(),
        pool: pool.clone(),
        metric: Box::new(|| 0),
        threshold: usize::MAX,
        throughput: Box::new(move || events_src.load(Ordering::Relaxed)),
        auto_max: true,
    });

    // Establish a known-good state at 2 threads.
    events.store(1000, Ordering::Relaxed);
    thread::sleep(Duration::from_millis(20));
    ctl.tick();
    let sizing = ctl.sizing("reverter").unwrap();
    assert_eq!(sizing.saved_threads, 2);
    assert!(sizing.saved_throughput > 0.0);

    // Oversize the pool by hand, then stall throughput: the next step
    // must revert toward the saved-best size.
    pool.add_threads(4).unwrap();
    assert_eq!(pool.num_threads(), 6);
    thread::sleep(Duration::from_millis(20));
    ctl.tick();

    assert!(wait_until(Duration::from_secs(5), || pool.num_threads() == 2));

    pool.stop();
    assert!(pool.await_termination(Some(Duration::from_secs(5))));
}

#[test]
fn background_loop_spawns_and_shuts_down() {
    let pool = test_pool(1, 4, 1);
    pool.start().unwrap();
    let ctl = PoolSizeController::new(ControllerConfig {
        controller_delay: Duration::from_millis(5),
        ..ControllerConfig::default()
    });
    ctl.register(StageRegistration {
        name: "bg".to_string(),
        pool: pool.clone(),
        metric: Box::new(|| 100),
        threshold: 8,
        throughput: Box::new(|| 0),
        auto_max: false,
    });

    let handle = ctl.spawn().unwrap();
    assert!(wait_until(Duration::from_secs(5), || pool.num_threads() == 4));
    ctl.shutdown();
    handle.join().unwrap();

    pool.stop();
    assert!(pool.await_termination(Some(Duration::from_secs(5))));
}
