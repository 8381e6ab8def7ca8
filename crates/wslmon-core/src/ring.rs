//! Fixed-capacity concurrent ring buffer.
//!
//! Backs the in-memory event snapshot on each side. Push is O(1) and
//! overwrites the oldest element when full; nothing here is persisted.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// A fixed-capacity ring buffer safe to share across threads.
///
/// Any thread may [`RingBuffer::push`]; any thread may take a consistent
/// [`RingBuffer::snapshot`]. The buffer never grows past its capacity: once
/// full, each push drops the oldest element.
#[derive(Debug)]
pub struct RingBuffer<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Creates a buffer holding at most `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Appends an element, overwriting the oldest when full.
    pub fn push(&self, value: T) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(value);
    }

    /// Returns the buffered elements in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.iter().cloned().collect()
    }

    /// Current element count.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.len()
    }

    /// Returns `true` when nothing has been pushed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fixed capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_push_below_capacity() {
        let ring = RingBuffer::new(4);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.snapshot(), vec![1, 2]);
    }

    #[test]
    fn test_overwrites_oldest_when_full() {
        let ring = RingBuffer::new(3);
        for value in 0..10 {
            ring.push(value);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.snapshot(), vec![7, 8, 9]);
    }

    #[test]
    fn test_capacity_one() {
        let ring = RingBuffer::new(1);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.snapshot(), vec!["b"]);
    }

    #[test]
    #[should_panic(expected = "capacity must be non-zero")]
    fn test_zero_capacity_panics() {
        let _ = RingBuffer::<u8>::new(0);
    }

    #[test]
    fn test_concurrent_pushes_keep_capacity_bound() {
        let ring = Arc::new(RingBuffer::new(16));
        let mut handles = Vec::new();
        for worker in 0..4 {
            let ring = Arc::clone(&ring);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    ring.push(worker * 1000 + i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ring.len(), 16);
    }
}
