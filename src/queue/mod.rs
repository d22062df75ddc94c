//! Bounded queue with admission control and transactional enqueue.

mod admission;
mod bounded;

pub use admission::{AdmissionPredicate, ThresholdPredicate};
pub use bounded::{BoundedQueue, EnqueueError, Transaction, TransactionError};
