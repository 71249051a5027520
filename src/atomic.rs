//! Lock-free counter and a bounded blocking queue with timed put/take (C2).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::CoreError;

/// A linearizable compare-and-swap counter.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicI64,
}

impl AtomicCounter {
    pub fn new(initial: i64) -> Self {
        AtomicCounter { value: AtomicI64::new(initial) }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn set(&self, new: i64) {
        self.value.store(new, Ordering::SeqCst);
    }

    pub fn increment(&self) -> i64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decrement(&self) -> i64 {
        self.value.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::SeqCst) + delta
    }

    /// Returns true iff the observed value was `expected` at the linearization point, in which
    /// case it is replaced with `new`.
    pub fn compare_and_swap(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A FIFO queue with a fixed positive capacity, blocking `put`/`take` with deadlines.
///
/// Per-producer FIFO order is preserved because producers contend for the same internal mutex
/// and `VecDeque` push/pop order matches wake order under `parking_lot`'s `Condvar`.
pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, CoreError> {
        if capacity == 0 {
            return Err(CoreError::InvalidArgument { reason: "queue capacity must be > 0".into() });
        }
        Ok(BoundedQueue {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        })
    }

    /// Blocks until space is available or `deadline` passes. Returns `true` on success.
    pub fn put(&self, item: T, deadline: Instant) -> bool {
        let mut guard = self.inner.lock();
        loop {
            if guard.len() < self.capacity {
                guard.push_back(item);
                self.not_empty.notify_one();
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let timed_out = self.not_full.wait_until(&mut guard, deadline).timed_out();
            if timed_out && guard.len() >= self.capacity {
                return false;
            }
        }
    }

    /// Blocks until an item is available or `deadline` passes.
    pub fn take(&self, deadline: Instant) -> Option<T> {
        let mut guard = self.inner.lock();
        loop {
            if let Some(item) = guard.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let timed_out = self.not_empty.wait_until(&mut guard, deadline).timed_out();
            if timed_out && guard.is_empty() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn counter_cas_true_iff_expected_matches() {
        let c = AtomicCounter::new(5);
        assert!(!c.compare_and_swap(4, 10));
        assert_eq!(c.get(), 5);
        assert!(c.compare_and_swap(5, 10));
        assert_eq!(c.get(), 10);
    }

    #[test]
    fn counter_increment_decrement() {
        let c = AtomicCounter::new(0);
        assert_eq!(c.increment(), 1);
        assert_eq!(c.increment(), 2);
        assert_eq!(c.decrement(), 1);
    }

    #[test]
    fn zero_capacity_queue_rejected() {
        let q: Result<BoundedQueue<i32>, _> = BoundedQueue::new(0);
        assert!(matches!(q, Err(CoreError::InvalidArgument { .. })));
    }

    #[test]
    fn put_take_round_trip() {
        let q = BoundedQueue::new(2).unwrap();
        let deadline = Instant::now() + Duration::from_millis(100);
        assert!(q.put(1, deadline));
        assert!(q.put(2, deadline));
        assert!(!q.put(3, Instant::now() + Duration::from_millis(10)));
        assert_eq!(q.take(deadline), Some(1));
        assert_eq!(q.take(deadline), Some(2));
        assert_eq!(q.take(Instant::now() + Duration::from_millis(10)), None);
    }

    #[test]
    fn blocked_put_wakes_on_take() {
        let q = Arc::new(BoundedQueue::new(1).unwrap());
        q.put(0, Instant::now() + Duration::from_millis(10));

        let q2 = q.clone();
        let handle = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            q2.put(99, deadline)
        });

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(q.take(Instant::now() + Duration::from_millis(100)), Some(0));
        assert!(handle.join().unwrap());
        assert_eq!(q.take(Instant::now() + Duration::from_millis(100)), Some(99));
    }
}
