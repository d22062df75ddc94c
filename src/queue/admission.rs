//! Admission control hooks evaluated by [`BoundedQueue`] before accepting
//! an element.
//!
//! [`BoundedQueue`]: super::BoundedQueue

use std::sync::atomic::{AtomicUsize, Ordering};

/// Accept/reject hook run under the queue's internal lock.
///
/// The current occupancy is passed in rather than read back from the
/// queue: the queue lock is held during the call and is not reentrant.
/// Implementations must not block.
pub trait AdmissionPredicate<T>: Send + Sync {
    fn accept(&self, queue_len: usize, element: &T) -> bool;

    /// Evaluate a whole list as one atomic admission. Each element is
    /// judged at the depth it would land at, so a batch that would cross
    /// a depth threshold is rejected as a unit.
    fn accept_many(&self, queue_len: usize, elements: &[T]) -> bool {
        elements
            .iter()
            .enumerate()
            .all(|(i, e)| self.accept(queue_len + i, e))
    }
}

/// Rejects once queue depth reaches a threshold. The threshold can be
/// retargeted live by a response-time controller.
pub struct ThresholdPredicate {
    threshold: AtomicUsize,
}

impl ThresholdPredicate {
    pub fn new(threshold: usize) -> Self {
        Self { threshold: AtomicUsize::new(threshold) }
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Acquire)
    }

    pub fn set_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::Release);
    }
}

impl<T> AdmissionPredicate<T> for ThresholdPredicate {
    fn accept(&self, queue_len: usize, _element: &T) -> bool {
        queue_len < self.threshold.load(Ordering::Acquire)
    }
}
