//! Runtime configuration loading from environment variables.
//!
//! All values are loaded from `STAGE_*` environment variables with
//! sensible defaults. Invalid values fall back to defaults without
//! crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `STAGE_QUEUE_CAPACITY` | 1024 | Default queue capacity |
//! | `STAGE_ADMISSION_THRESHOLD` | 0 | Admission threshold (0 = off) |
//! | `STAGE_POOL_THRESHOLD` | 8 | Queue depth that triggers pool growth |
//! | `STAGE_MIN_THREADS` | 1 | Pool floor |
//! | `STAGE_MAX_THREADS` | 0 | Pool ceiling (0 = unbounded) |
//! | `STAGE_INITIAL_THREADS` | 1 | Threads at start (0 = one per CPU) |
//! | `STAGE_BLOCK_TIME_MS` | 1000 | Worker dequeue wait |
//! | `STAGE_IDLE_TIMEOUT_MS` | 5000 | Idle time before a worker may exit |
//! | `STAGE_SHUTDOWN_TIMEOUT` | 30 | Graceful stage stop timeout (secs) |
//! | `STAGE_CRASH_ON_FAILURE` | false | Abort process on handler failure |
//! | `STAGE_AUTO_MAX_DETECT` | false | Enable throughput hill-climbing |
//! | `STAGE_CONTROLLER_DELAY_MS` | 2000 | Size-controller tick period |
//! | `STAGE_MEASUREMENT_INTERVAL` | 1 | Ticks between throughput samples |
//! | `STAGE_AUTO_MAX_INTERVAL` | 5 | Ticks between hill-climb steps |
//! | `STAGE_RANDOM_JUMP` | 4 | Hill-climb perturbation bound |

use std::time::Duration;

use serde::Serialize;

use crate::pool::ControllerConfig;
use crate::RuntimeConfig;

/// Effective runtime configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub queue_capacity: usize,
    pub admission_threshold: usize,
    pub pool_threshold: usize,
    pub min_threads: usize,
    pub max_threads: usize,
    pub initial_threads: usize,
    pub block_time_ms: u64,
    pub idle_timeout_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub crash_on_failure: bool,
    pub auto_max_detect: bool,
    pub controller_delay_ms: u64,
    pub measurement_interval: u64,
    pub auto_max_interval: u64,
    pub random_jump: usize,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a boolean env var ("1"/"true"/"yes" vs "0"/"false"/"no").
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn load_controller_config() -> ControllerConfig {
    let delay_ms = parse_u64("STAGE_CONTROLLER_DELAY_MS", 2000).max(1);
    let measurement_interval = parse_u64("STAGE_MEASUREMENT_INTERVAL", 1).max(1);
    let auto_max_interval = parse_u64("STAGE_AUTO_MAX_INTERVAL", 5).max(1);
    let random_jump = parse_usize("STAGE_RANDOM_JUMP", 4);
    ControllerConfig {
        controller_delay: Duration::from_millis(delay_ms),
        measurement_interval,
        auto_max_interval,
        random_jump,
        ..ControllerConfig::default()
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.controller = load_controller_config();

    let stage = &mut config.stage;
    stage.queue_capacity = parse_usize("STAGE_QUEUE_CAPACITY", 1024).max(1);
    stage.admission_threshold = parse_usize("STAGE_ADMISSION_THRESHOLD", 0);
    stage.pool_threshold = parse_usize("STAGE_POOL_THRESHOLD", 8);
    stage.auto_max_detect = parse_bool("STAGE_AUTO_MAX_DETECT", false);
    stage.shutdown_timeout =
        Duration::from_secs(parse_u64("STAGE_SHUTDOWN_TIMEOUT", 30).max(1));

    let pool = &mut stage.pool;
    pool.min_threads = parse_usize("STAGE_MIN_THREADS", 1).max(1);
    pool.max_threads = match parse_usize("STAGE_MAX_THREADS", 0) {
        0 => None,
        n => Some(n.max(pool.min_threads)),
    };
    pool.initial_threads = parse_usize("STAGE_INITIAL_THREADS", 1);
    pool.block_time = Duration::from_millis(parse_u64("STAGE_BLOCK_TIME_MS", 1000).max(1));
    pool.idle_timeout = Duration::from_millis(parse_u64("STAGE_IDLE_TIMEOUT_MS", 5000).max(1));
    pool.crash_on_failure = parse_bool("STAGE_CRASH_ON_FAILURE", false);

    config
}

impl RuntimeConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            queue_capacity: self.stage.queue_capacity,
            admission_threshold: self.stage.admission_threshold,
            pool_threshold: self.stage.pool_threshold,
            min_threads: self.stage.pool.min_threads,
            max_threads: self.stage.pool.max_threads.unwrap_or(0),
            initial_threads: self.stage.pool.initial_threads,
            block_time_ms: self.stage.pool.block_time.as_millis() as u64,
            idle_timeout_ms: self.stage.pool.idle_timeout.as_millis() as u64,
            shutdown_timeout_secs: self.stage.shutdown_timeout.as_secs(),
            crash_on_failure: self.stage.pool.crash_on_failure,
            auto_max_detect: self.stage.auto_max_detect,
            controller_delay_ms: self.controller.controller_delay.as_millis() as u64,
            measurement_interval: self.controller.measurement_interval,
            auto_max_interval: self.controller.auto_max_interval,
            random_jump: self.controller.random_jump,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "STAGE_QUEUE_CAPACITY",
        "STAGE_ADMISSION_THRESHOLD",
        "STAGE_POOL_THRESHOLD",
        "STAGE_MIN_THREADS",
        "STAGE_MAX_THREADS",
        "STAGE_INITIAL_THREADS",
        "STAGE_BLOCK_TIME_MS",
        "STAGE_IDLE_TIMEOUT_MS",
        "STAGE_SHUTDOWN_TIMEOUT",
        "STAGE_CRASH_ON_FAILURE",
        "STAGE_AUTO_MAX_DETECT",
        "STAGE_CONTROLLER_DELAY_MS",
        "STAGE_MEASUREMENT_INTERVAL",
        "STAGE_AUTO_MAX_INTERVAL",
        "STAGE_RANDOM_JUMP",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.stage.queue_capacity, 1024);
        assert_eq!(cfg.stage.admission_threshold, 0);
        assert_eq!(cfg.stage.pool_threshold, 8);
        assert_eq!(cfg.stage.pool.min_threads, 1);
        assert_eq!(cfg.stage.pool.max_threads, None);
        assert_eq!(cfg.stage.pool.initial_threads, 1);
        assert_eq!(cfg.stage.pool.block_time.as_millis(), 1000);
        assert_eq!(cfg.stage.pool.idle_timeout.as_millis(), 5000);
        assert_eq!(cfg.stage.shutdown_timeout.as_secs(), 30);
        assert!(!cfg.stage.pool.crash_on_failure);
        assert!(!cfg.stage.auto_max_detect);
        assert_eq!(cfg.controller.controller_delay.as_millis(), 2000);
        assert_eq!(cfg.controller.measurement_interval, 1);
        assert_eq!(cfg.controller.auto_max_interval, 5);
        assert_eq!(cfg.controller.random_jump, 4);
    }

    #[test]
    fn env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("STAGE_QUEUE_CAPACITY", "64");
        std::env::set_var("STAGE_MAX_THREADS", "8");
        std::env::set_var("STAGE_AUTO_MAX_DETECT", "true");
        std::env::set_var("STAGE_CONTROLLER_DELAY_MS", "100");
        let cfg = load();
        assert_eq!(cfg.stage.queue_capacity, 64);
        assert_eq!(cfg.stage.pool.max_threads, Some(8));
        assert!(cfg.stage.auto_max_detect);
        assert_eq!(cfg.controller.controller_delay.as_millis(), 100);
        clear_env_vars();
    }

    #[test]
    fn invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("STAGE_QUEUE_CAPACITY", "not_a_number");
        std::env::set_var("STAGE_CRASH_ON_FAILURE", "maybe");
        let cfg = load();
        assert_eq!(cfg.stage.queue_capacity, 1024);
        assert!(!cfg.stage.pool.crash_on_failure);
        clear_env_vars();
    }

    #[test]
    fn max_threads_never_below_min() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("STAGE_MIN_THREADS", "4");
        std::env::set_var("STAGE_MAX_THREADS", "2");
        let cfg = load();
        assert_eq!(cfg.stage.pool.max_threads, Some(4));
        clear_env_vars();
    }

    #[test]
    fn effective_config_contains_all_fields() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        let eff = cfg.effective_config();
        assert!(eff.queue_capacity > 0);
        assert!(eff.block_time_ms > 0);
        assert!(eff.idle_timeout_ms > 0);
        assert!(eff.shutdown_timeout_secs > 0);
        assert!(eff.controller_delay_ms > 0);
        assert!(eff.measurement_interval > 0);
        assert!(eff.auto_max_interval > 0);
        let json = serde_json::to_string(&eff).unwrap();
        assert!(json.contains("queue_capacity"));
    }
}
