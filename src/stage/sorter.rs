//! Batch claiming strategies.
//!
//! A sorter decides how many queued elements one dispatch cycle claims.
//! Batches land in a caller-owned buffer that each worker reuses across
//! cycles, so claiming allocates nothing in steady state.

use std::sync::Arc;
use std::time::Duration;

use super::handler::AggregationThrottle;
use crate::queue::BoundedQueue;

/// Decides the size of the next batch and claims it into `buf`.
/// Returns the number of elements claimed.
pub trait BatchSorter<T>: Send + Sync {
    fn next_batch(
        &self,
        queue: &BoundedQueue<T>,
        buf: &mut Vec<T>,
        timeout: Option<Duration>,
    ) -> usize;
}

/// Claims the entire queue content every cycle.
pub struct NullBatchSorter;

impl<T: Send> BatchSorter<T> for NullBatchSorter {
    fn next_batch(
        &self,
        queue: &BoundedQueue<T>,
        buf: &mut Vec<T>,
        timeout: Option<Duration>,
    ) -> usize {
        if timeout == Some(Duration::ZERO) {
            queue.dequeue_all(buf)
        } else {
            queue.blocking_dequeue_all(timeout, buf)
        }
    }
}

/// Claims up to the aggregation target recommended by the throttle
/// collaborator. The target is requested once per cycle and the claim is
/// clamped to it; the throttle's own formula is not this module's concern.
pub struct ThrottledBatchSorter {
    throttle: Arc<dyn AggregationThrottle>,
}

impl ThrottledBatchSorter {
    pub fn new(throttle: Arc<dyn AggregationThrottle>) -> Self {
        Self { throttle }
    }
}

impl<T: Send> BatchSorter<T> for ThrottledBatchSorter {
    fn next_batch(
        &self,
        queue: &BoundedQueue<T>,
        buf: &mut Vec<T>,
        timeout: Option<Duration>,
    ) -> usize {
        // Target floor of 1 keeps a mis-tuned throttle from spinning the
        // dispatch loop on empty claims.
        let max = self.throttle.agg_target().map(|n| n.max(1));
        match max {
            None => {
                if timeout == Some(Duration::ZERO) {
                    queue.dequeue_all(buf)
                } else {
                    queue.blocking_dequeue_all(timeout, buf)
                }
            }
            Some(max) => {
                if timeout == Some(Duration::ZERO) {
                    queue.dequeue_up_to(max, buf)
                } else {
                    queue.blocking_dequeue_up_to(timeout, max, buf)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::FixedThrottle;

    #[test]
    fn null_sorter_drains_everything() {
        let queue = BoundedQueue::new(16);
        queue.enqueue_many(vec![1, 2, 3, 4]).unwrap();
        let sorter = NullBatchSorter;
        let mut buf = Vec::new();
        let n = sorter.next_batch(&queue, &mut buf, Some(Duration::ZERO));
        assert_eq!(n, 4);
        assert_eq!(buf, vec![1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn throttled_sorter_clamps_to_target() {
        let queue = BoundedQueue::new(16);
        queue.enqueue_many(vec![1, 2, 3, 4, 5]).unwrap();
        let sorter = ThrottledBatchSorter::new(Arc::new(FixedThrottle(2)));
        let mut buf = Vec::new();
        assert_eq!(sorter.next_batch(&queue, &mut buf, Some(Duration::ZERO)), 2);
        assert_eq!(buf, vec![1, 2]);
        assert_eq!(queue.len(), 3);
    }

    /// `None` target means unbounded: behave like the null sorter.
    struct DrainThrottle;

    impl AggregationThrottle for DrainThrottle {
        fn agg_target(&self) -> Option<usize> {
            None
        }
    }

    #[test]
    fn unbounded_target_drains_all() {
        let queue = BoundedQueue::new(16);
        queue.enqueue_many(vec![1, 2, 3]).unwrap();
        let sorter = ThrottledBatchSorter::new(Arc::new(DrainThrottle));
        let mut buf = Vec::new();
        assert_eq!(sorter.next_batch(&queue, &mut buf, Some(Duration::ZERO)), 3);
    }
}
