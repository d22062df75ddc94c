//! Bounded, admission-controlled event queue.
//!
//! The queue is the backpressure point of a stage: producers enqueue
//! (lossy, all-or-nothing, or transactionally) and worker threads pull
//! batches out the other side. Capacity can be resized live; shrinking
//! never evicts, it only throttles future admission.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::admission::AdmissionPredicate;

/// Smallest physical buffer ever allocated. The logical capacity may be
/// larger; storage grows geometrically on demand.
const INITIAL_PHYSICAL: usize = 16;

/// Error returned by the enqueue family. Carries the rejected payload
/// back to the caller, channel-style.
pub enum EnqueueError<T> {
    /// Admission rejected or capacity exhausted. Recoverable: retry or drop.
    Full(T),
    /// The queue is no longer serviced. Fatal to this operation.
    Closed(T),
}

impl<T> EnqueueError<T> {
    /// Recover the rejected payload.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "Full(..)"),
            Self::Closed(_) => write!(f, "Closed(..)"),
        }
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "queue is full"),
            Self::Closed(_) => write!(f, "queue is closed"),
        }
    }
}

impl<T> std::error::Error for EnqueueError<T> {}

/// Error returned by [`Transaction::commit`].
pub enum TransactionError<T> {
    /// The queue was closed between prepare and commit.
    Closed(Vec<T>),
    /// The held element list changed size since prepare. This is a caller
    /// bug; the reservation has already been released.
    SizeMismatch {
        expected: usize,
        actual: usize,
        items: Vec<T>,
    },
}

impl<T> TransactionError<T> {
    /// Recover the held elements.
    pub fn into_inner(self) -> Vec<T> {
        match self {
            Self::Closed(items) | Self::SizeMismatch { items, .. } => items,
        }
    }
}

impl<T> fmt::Debug for TransactionError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => write!(f, "Closed(..)"),
            Self::SizeMismatch { expected, actual, .. } => f
                .debug_struct("SizeMismatch")
                .field("expected", expected)
                .field("actual", actual)
                .finish(),
        }
    }
}

impl<T> fmt::Display for TransactionError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => write!(f, "queue is closed"),
            Self::SizeMismatch { expected, actual, .. } => write!(
                f,
                "transaction size changed since prepare: reserved {expected}, committing {actual}",
            ),
        }
    }
}

impl<T> std::error::Error for TransactionError<T> {}

struct Inner<T> {
    /// Circular storage. `buf.len()` is the physical size and may lag the
    /// logical capacity; it grows geometrically and re-linearizes.
    buf: Vec<Option<T>>,
    head: usize,
    len: usize,
    capacity: usize,
    /// Slots held by open transactions, not yet visible to consumers.
    reserved: usize,
    closed: bool,
    next_tx: u64,
    open_tx: HashMap<u64, usize>,
}

impl<T> Inner<T> {
    fn free(&self) -> usize {
        self.capacity.saturating_sub(self.len + self.reserved)
    }

    fn has_room(&self, count: usize) -> bool {
        self.len + self.reserved + count <= self.capacity
    }

    fn push_back(&mut self, item: T) {
        if self.len == self.buf.len() {
            self.grow(self.len + 1);
        }
        let idx = (self.head + self.len) % self.buf.len();
        self.buf[idx] = Some(item);
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.buf[self.head].take();
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        item
    }

    /// Grow physical storage to at least `needed` slots, re-linearizing the
    /// occupied slice to offset 0 so concurrent extract sees one run.
    fn grow(&mut self, needed: usize) {
        let target = self.capacity.max(needed);
        let new_len = (self.buf.len() + self.buf.len() / 2 + 1)
            .min(target)
            .max(needed);
        let physical = self.buf.len();
        let mut new_buf: Vec<Option<T>> = (0..new_len).map(|_| None).collect();
        for (i, slot) in new_buf.iter_mut().enumerate().take(self.len) {
            *slot = self.buf[(self.head + i) % physical].take();
        }
        self.buf = new_buf;
        self.head = 0;
    }

    fn check_invariants(&self) {
        debug_assert!(self.len <= self.buf.len());
        debug_assert_eq!(self.reserved, self.open_tx.values().sum::<usize>());
        // occupied + free + reserved == capacity whenever occupancy fits;
        // after a live shrink free saturates at zero.
        debug_assert_eq!(
            self.len + self.free() + self.reserved,
            self.capacity.max(self.len + self.reserved),
        );
    }
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    /// Signaled on every successful enqueue/commit; wakes a consumer.
    not_empty: Condvar,
    /// Signaled on dequeue, abort, and capacity increase; wakes a producer.
    not_full: Condvar,
    predicate: Option<Arc<dyn AdmissionPredicate<T>>>,
}

impl<T> Shared<T> {
    fn admit_one(&self, len: usize, item: &T) -> bool {
        self.predicate.as_ref().map_or(true, |p| p.accept(len, item))
    }

    fn admit_many(&self, len: usize, items: &[T]) -> bool {
        self.predicate
            .as_ref()
            .map_or(true, |p| p.accept_many(len, items))
    }
}

/// Thread-safe bounded queue with admission control and a transactional
/// (prepare/commit/abort) enqueue protocol.
///
/// Cloning yields another handle to the same queue, like a channel
/// endpoint. Elements are delivered FIFO relative to commit order.
pub struct BoundedQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: Send> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Queue with an admission predicate evaluated before every accept.
    pub fn with_predicate(capacity: usize, predicate: Arc<dyn AdmissionPredicate<T>>) -> Self {
        Self::build(capacity, Some(predicate))
    }

    fn build(capacity: usize, predicate: Option<Arc<dyn AdmissionPredicate<T>>>) -> Self {
        let physical = capacity.min(INITIAL_PHYSICAL).max(1);
        let inner = Inner {
            buf: (0..physical).map(|_| None).collect(),
            head: 0,
            len: 0,
            capacity,
            reserved: 0,
            closed: false,
            next_tx: 1,
            open_tx: HashMap::new(),
        };
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                predicate,
            }),
        }
    }

    /// Enqueue one element, waking one waiting consumer on success.
    pub fn enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(EnqueueError::Closed(item));
        }
        if !inner.has_room(1) || !self.shared.admit_one(inner.len, &item) {
            return Err(EnqueueError::Full(item));
        }
        inner.push_back(item);
        inner.check_invariants();
        drop(inner);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue, swallowing `Full`. Returns false when the element was
    /// dropped (either rejected or the queue is closed).
    pub fn enqueue_lossy(&self, item: T) -> bool {
        self.enqueue(item).is_ok()
    }

    /// Enqueue while blocking until capacity is available, up to `timeout`
    /// (`None` = forever). Returns `Full` on timeout.
    pub fn blocking_enqueue(
        &self,
        item: T,
        timeout: Option<Duration>,
    ) -> Result<(), EnqueueError<T>> {
        if timeout == Some(Duration::ZERO) {
            return self.enqueue(item);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.shared.inner.lock();
        loop {
            if inner.closed {
                return Err(EnqueueError::Closed(item));
            }
            if inner.has_room(1) && self.shared.admit_one(inner.len, &item) {
                inner.push_back(item);
                inner.check_invariants();
                drop(inner);
                self.shared.not_empty.notify_one();
                return Ok(());
            }
            if !self.wait_not_full(&mut inner, deadline) {
                return Err(EnqueueError::Full(item));
            }
        }
    }

    /// All-or-nothing batch enqueue: either every element is accepted as
    /// one atomic unit or the queue is left unchanged.
    pub fn enqueue_many(&self, items: Vec<T>) -> Result<(), EnqueueError<Vec<T>>> {
        if items.is_empty() {
            return Ok(());
        }
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(EnqueueError::Closed(items));
        }
        if !inner.has_room(items.len()) || !self.shared.admit_many(inner.len, &items) {
            return Err(EnqueueError::Full(items));
        }
        for item in items {
            inner.push_back(item);
        }
        inner.check_invariants();
        drop(inner);
        self.shared.not_empty.notify_all();
        Ok(())
    }

    /// Reserve capacity for `items` without making them visible. Commit
    /// publishes them (FIFO position is commit time, not prepare time);
    /// abort or drop releases the reservation.
    pub fn prepare(&self, items: Vec<T>) -> Result<Transaction<T>, EnqueueError<Vec<T>>> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(EnqueueError::Closed(items));
        }
        if !inner.has_room(items.len()) || !self.shared.admit_many(inner.len, &items) {
            return Err(EnqueueError::Full(items));
        }
        let id = inner.next_tx;
        inner.next_tx += 1;
        inner.reserved += items.len();
        inner.open_tx.insert(id, items.len());
        inner.check_invariants();
        Ok(Transaction {
            shared: Arc::clone(&self.shared),
            id,
            reserved: items.len(),
            items,
            done: false,
        })
    }

    /// Non-blocking single dequeue.
    pub fn dequeue(&self) -> Option<T> {
        let mut inner = self.shared.inner.lock();
        let item = inner.pop_front();
        if item.is_some() {
            inner.check_invariants();
            drop(inner);
            self.shared.not_full.notify_one();
        }
        item
    }

    /// Non-blocking: move up to `max` elements into `buf`. Returns the
    /// number claimed. `buf` is appended to, never cleared, so callers can
    /// reuse one allocation per worker.
    pub fn dequeue_up_to(&self, max: usize, buf: &mut Vec<T>) -> usize {
        let mut inner = self.shared.inner.lock();
        let n = max.min(inner.len);
        buf.reserve(n);
        for _ in 0..n {
            match inner.pop_front() {
                Some(item) => buf.push(item),
                None => break,
            }
        }
        if n > 0 {
            inner.check_invariants();
            drop(inner);
            self.shared.not_full.notify_all();
        }
        n
    }

    /// Non-blocking drain of the entire queue into `buf`.
    pub fn dequeue_all(&self, buf: &mut Vec<T>) -> usize {
        self.dequeue_up_to(usize::MAX, buf)
    }

    /// Block until one element is available or `timeout` elapses
    /// (`None` = forever, `Some(ZERO)` = non-blocking).
    pub fn blocking_dequeue(&self, timeout: Option<Duration>) -> Option<T> {
        if timeout == Some(Duration::ZERO) {
            return self.dequeue();
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(item) = inner.pop_front() {
                inner.check_invariants();
                drop(inner);
                self.shared.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            if !self.wait_not_empty(&mut inner, deadline) {
                return None;
            }
        }
    }

    /// Block until at least one element is available, then claim up to
    /// `max` into `buf`.
    pub fn blocking_dequeue_up_to(
        &self,
        timeout: Option<Duration>,
        max: usize,
        buf: &mut Vec<T>,
    ) -> usize {
        if timeout == Some(Duration::ZERO) {
            return self.dequeue_up_to(max, buf);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.shared.inner.lock();
        loop {
            if inner.len > 0 {
                let n = max.min(inner.len);
                buf.reserve(n);
                for _ in 0..n {
                    match inner.pop_front() {
                        Some(item) => buf.push(item),
                        None => break,
                    }
                }
                inner.check_invariants();
                drop(inner);
                self.shared.not_full.notify_all();
                return n;
            }
            if inner.closed {
                return 0;
            }
            if !self.wait_not_empty(&mut inner, deadline) {
                return 0;
            }
        }
    }

    /// Block until at least one element is available, then drain everything.
    pub fn blocking_dequeue_all(&self, timeout: Option<Duration>, buf: &mut Vec<T>) -> usize {
        self.blocking_dequeue_up_to(timeout, usize::MAX, buf)
    }

    /// Resize the logical capacity. Growing wakes blocked producers;
    /// shrinking below occupancy evicts nothing and only throttles
    /// admission until occupancy drops under the new capacity.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.shared.inner.lock();
        let grew = capacity > inner.capacity;
        inner.capacity = capacity;
        inner.check_invariants();
        drop(inner);
        if grew {
            self.shared.not_full.notify_all();
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.inner.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity currently held by open transactions.
    pub fn reserved(&self) -> usize {
        self.shared.inner.lock().reserved
    }

    /// Close the queue: further enqueues fail `Closed`; dequeues drain the
    /// remaining elements and then return empty. Wakes all waiters.
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock();
        inner.closed = true;
        drop(inner);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    /// Wake every blocked consumer so it re-checks state. Used by forced
    /// pool shutdown; waiters treat the wakeup as a request to re-check,
    /// never as an error.
    pub fn notify_consumers(&self) {
        self.shared.not_empty.notify_all();
    }

    /// Wait on `not_empty`; false means the deadline passed.
    fn wait_not_empty(&self, inner: &mut MutexGuard<'_, Inner<T>>, deadline: Option<Instant>) -> bool {
        match deadline {
            None => {
                self.shared.not_empty.wait(inner);
                true
            }
            Some(d) => !self.shared.not_empty.wait_until(inner, d).timed_out(),
        }
    }

    /// Wait on `not_full`; false means the deadline passed.
    fn wait_not_full(&self, inner: &mut MutexGuard<'_, Inner<T>>, deadline: Option<Instant>) -> bool {
        match deadline {
            None => {
                self.shared.not_full.wait(inner);
                true
            }
            Some(d) => !self.shared.not_full.wait_until(inner, d).timed_out(),
        }
    }
}

/// Handle to a provisional enqueue: a reserved capacity slice plus the
/// held element set. Exactly one of commit/abort runs; dropping an
/// uncommitted transaction aborts it, so reserved capacity cannot leak.
pub struct Transaction<T> {
    shared: Arc<Shared<T>>,
    id: u64,
    reserved: usize,
    items: Vec<T>,
    done: bool,
}

impl<T: Send> Transaction<T> {
    /// The held element set. The list length must match the reservation at
    /// commit time.
    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut Vec<T> {
        &mut self.items
    }

    /// Number of slots reserved at prepare time.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Publish the held elements at the current FIFO tail.
    pub fn commit(mut self) -> Result<(), TransactionError<T>> {
        self.done = true;
        let items = mem::take(&mut self.items);
        let mut inner = self.shared.inner.lock();
        let reserved = inner.open_tx.remove(&self.id).unwrap_or(self.reserved);
        inner.reserved -= reserved;
        if inner.closed {
            inner.check_invariants();
            drop(inner);
            self.shared.not_full.notify_all();
            return Err(TransactionError::Closed(items));
        }
        if items.len() != reserved {
            // Caller bug: the held list changed size after prepare. The
            // reservation is released so capacity is not leaked.
            tracing::error!(
                expected = reserved,
                actual = items.len(),
                "transaction list size changed since prepare; releasing reservation",
            );
            inner.check_invariants();
            drop(inner);
            self.shared.not_full.notify_all();
            return Err(TransactionError::SizeMismatch {
                expected: reserved,
                actual: items.len(),
                items,
            });
        }
        let count = items.len();
        for item in items {
            inner.push_back(item);
        }
        inner.check_invariants();
        drop(inner);
        if count == 1 {
            self.shared.not_empty.notify_one();
        } else {
            self.shared.not_empty.notify_all();
        }
        Ok(())
    }

    /// Release the reservation and return the held elements.
    pub fn abort(mut self) -> Vec<T> {
        self.done = true;
        let items = mem::take(&mut self.items);
        self.release();
        items
    }

    fn release(&self) {
        let mut inner = self.shared.inner.lock();
        if let Some(reserved) = inner.open_tx.remove(&self.id) {
            inner.reserved -= reserved;
        }
        inner.check_invariants();
        drop(inner);
        self.shared.not_full.notify_all();
    }
}

impl<T> Drop for Transaction<T> {
    fn drop(&mut self) {
        if !self.done {
            let mut inner = self.shared.inner.lock();
            if let Some(reserved) = inner.open_tx.remove(&self.id) {
                inner.reserved -= reserved;
            }
            inner.check_invariants();
            drop(inner);
            self.shared.not_full.notify_all();
        }
    }
}
