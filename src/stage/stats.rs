//! Per-stage dispatch statistics.
//!
//! Updated by dispatch loops and read by the size controller and response
//! time controllers. Staleness of one sampling interval is acceptable, so
//! readers take no strong-consistency measures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Smoothing constant for the service-rate estimate.
const ALPHA: f64 = 0.3;

#[derive(Default)]
pub struct StageStats {
    events_processed: AtomicU64,
    batches_processed: AtomicU64,
    handler_failures: AtomicU64,
    /// Exponentially smoothed service rate in events per second.
    service_rate: Mutex<f64>,
}

/// Point-in-time copy of a stage's statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub events_processed: u64,
    pub batches_processed: u64,
    pub handler_failures: u64,
    pub service_rate: f64,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl StageStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one handled batch and fold its observed rate into the
    /// smoothed service rate.
    pub fn record_batch(&self, batch_len: usize, elapsed: Duration) {
        self.events_processed
            .fetch_add(batch_len as u64, Ordering::Relaxed);
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 && batch_len > 0 {
            let rate = batch_len as f64 / secs;
            let mut avg = self.service_rate.lock();
            *avg = if *avg == 0.0 { rate } else { ALPHA * rate + (1.0 - ALPHA) * *avg };
        }
    }

    pub fn record_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn batches_processed(&self) -> u64 {
        self.batches_processed.load(Ordering::Relaxed)
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    pub fn service_rate(&self) -> f64 {
        *self.service_rate.lock()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_processed: self.events_processed(),
            batches_processed: self.batches_processed(),
            handler_failures: self.handler_failures(),
            service_rate: self.service_rate(),
        }
    }
}
