//! A countdown latch layered on [`AtomicEvent`], ported in spirit from
//! `count_down_latch.py`: a fixed number of `count_down()` calls opens the
//! gate for every `wait()`er, and the gate never closes again.

use crate::atomic::{AtomicEvent, AtomicInt64};
use crate::error::MapError;

/// A one-shot gate that opens once `count_down()` has been called `count`
/// times. Cloning the latch is not supported; share it behind an `Arc` the
/// way callers share a `ConcurrentMap`.
pub struct CountDownLatch {
    remaining: AtomicInt64,
    event: AtomicEvent,
}

impl CountDownLatch {
    /// Create a latch that opens after `count` calls to `count_down()`.
    /// A `count` of zero opens the gate immediately.
    pub fn new(count: u32) -> Self {
        let latch = Self {
            remaining: AtomicInt64::new(count as i64),
            event: AtomicEvent::new(),
        };
        if count == 0 {
            latch.event.set();
        }
        latch
    }

    /// Decrement the count by one. Opens the gate on the call that brings
    /// the count to zero; further calls after that are harmless no-ops.
    /// `Err(MapError::InvalidArgument)` if called more times than `count`.
    pub fn count_down(&self) -> Result<(), MapError> {
        if self.event.is_set() {
            return Ok(());
        }
        let remaining = self
            .remaining
            .add(-1)
            .map_err(|_| MapError::InvalidArgument("count_down called too many times".to_string()))?;
        match remaining.cmp(&0) {
            std::cmp::Ordering::Greater => Ok(()),
            std::cmp::Ordering::Equal => {
                self.event.set();
                Ok(())
            }
            std::cmp::Ordering::Less => Err(MapError::InvalidArgument(
                "count_down called too many times".to_string(),
            )),
        }
    }

    /// Current count (never negative once properly used).
    pub fn count(&self) -> i64 {
        self.remaining.get().max(0)
    }

    /// Block the calling thread until the gate opens.
    pub fn wait(&self) {
        self.event.wait();
    }

    /// True once the gate has opened.
    pub fn is_open(&self) -> bool {
        self.event.is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn zero_count_opens_immediately() {
        let latch = CountDownLatch::new(0);
        assert!(latch.is_open());
        latch.wait();
    }

    #[test]
    fn opens_after_exact_count() {
        let latch = CountDownLatch::new(3);
        latch.count_down().unwrap();
        latch.count_down().unwrap();
        assert!(!latch.is_open());
        latch.count_down().unwrap();
        assert!(latch.is_open());
    }

    #[test]
    fn extra_count_downs_are_harmless() {
        let latch = CountDownLatch::new(1);
        latch.count_down().unwrap();
        latch.count_down().unwrap();
        assert!(latch.is_open());
    }

    #[test]
    fn workers_release_waiters() {
        let latch = Arc::new(CountDownLatch::new(4));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let latch = latch.clone();
                thread::spawn(move || latch.count_down().unwrap())
            })
            .collect();
        latch.wait();
        assert!(latch.is_open());
        for w in workers {
            w.join().unwrap();
        }
    }
}
