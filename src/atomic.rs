//! Atomic primitives.
//!
//! Portable wrappers around `core::sync::atomic`, plus the three secondary
//! primitives backing the map's own contracts: a 64-bit atomic integer
//! (`AtomicInt64`), an atomically swappable reference cell (`AtomicCell`),
//! and a one-shot event (`AtomicEvent`). None of these are meant to compete
//! with `std`'s atomics on their own — they exist because `ConcurrentMap`
//! and its derived constructs (`CountDownLatch`, `AtomicCache`) need
//! exactly this surface.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use parking_lot::{Condvar, Mutex};

use crate::error::MapError;

/// CPU pause hint for spin loops.
#[inline(always)]
pub fn stall() {
    std::hint::spin_loop();
}

/// A 64-bit signed atomic integer with overflow-checked arithmetic.
///
/// Plain `AtomicI64` wraps silently on overflow; this type instead reports
/// `MapError::Overflow` when a delta would carry the counter out of signed
/// 64-bit range.
#[derive(Debug, Default)]
pub struct AtomicInt64 {
    value: AtomicI64,
}

impl AtomicInt64 {
    /// Create a new counter with the given initial value.
    pub const fn new(value: i64) -> Self {
        Self {
            value: AtomicI64::new(value),
        }
    }

    /// Load the current value.
    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Store a new value.
    #[inline]
    pub fn set(&self, new: i64) {
        self.value.store(new, Ordering::Release);
    }

    /// Atomically add `delta`, returning the new value, or
    /// `MapError::Overflow` if the addition would overflow `i64`.
    pub fn add(&self, delta: i64) -> Result<i64, MapError> {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            let new = current.checked_add(delta).ok_or(MapError::Overflow)?;
            match self.value.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(new),
                Err(observed) => current = observed,
            }
        }
    }

    /// Atomically subtract `delta`, returning the new value, or
    /// `MapError::Overflow` on underflow.
    pub fn sub(&self, delta: i64) -> Result<i64, MapError> {
        self.add(delta.checked_neg().ok_or(MapError::Overflow)?)
    }

    /// Compare-and-set: succeed only if the current value equals `expected`.
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// An atomically swappable, epoch-reclaimed reference cell.
///
/// This backs an entry's value slot in `entry.rs`: `compare_and_set`'s
/// value-only mutation is a single CAS here.
pub struct AtomicCell<T> {
    slot: Atomic<T>,
}

impl<T> AtomicCell<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            slot: Atomic::new(value),
        }
    }

    /// Create an empty cell (used for the NONE sentinel during reservation).
    pub fn empty() -> Self {
        Self {
            slot: Atomic::null(),
        }
    }

    /// Load a reference to the current value, valid for the lifetime of
    /// `guard`. Returns `None` if the cell is empty.
    pub fn load<'g>(&self, guard: &'g Guard) -> Option<&'g T> {
        let shared = self.slot.load(Ordering::Acquire, guard);
        unsafe { shared.as_ref() }
    }

    /// Unconditionally replace the value, retiring the old one once no
    /// in-flight operation can still observe it.
    pub fn store(&self, value: T, guard: &Guard) {
        let new = Owned::new(value);
        let old = self.slot.swap(new, Ordering::AcqRel, guard);
        if !old.is_null() {
            unsafe { guard.defer_destroy(old) };
        }
    }

    /// Compare-and-swap by reference equality of the currently loaded value
    /// against `current`. `ConcurrentMap::compare_and_set`'s "equal by user
    /// equality" clause is implemented one layer up, in `map.rs`, by loading
    /// then re-validating with this before the CAS.
    pub fn compare_and_swap(&self, current: Shared<'_, T>, new: T, guard: &Guard) -> bool {
        let new = Owned::new(new);
        match self
            .slot
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(old) => {
                if !old.is_null() {
                    unsafe { guard.defer_destroy(old) };
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Raw `Shared` pointer to the current value, for passing into
    /// `compare_and_swap`.
    pub fn load_raw<'g>(&self, guard: &'g Guard) -> Shared<'g, T> {
        self.slot.load(Ordering::Acquire, guard)
    }
}

/// A one-shot event: `set()` is the only transition (unset → set), and is
/// idempotent. All waiters observe `SET` exactly once it has happened, and
/// never observe it becoming unset again.
#[derive(Debug)]
pub struct AtomicEvent {
    flag: AtomicBool,
    gate: Mutex<()>,
    condvar: Condvar,
}

impl Default for AtomicEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicEvent {
    /// Create a new, unset event.
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            gate: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// True once `set()` has been called at least once.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Set the event, waking every blocked waiter. Safe to call more than
    /// once; only the first call has any effect.
    pub fn set(&self) {
        if !self.flag.swap(true, Ordering::AcqRel) {
            let _guard = self.gate.lock();
            self.condvar.notify_all();
        }
    }

    /// Block the calling thread until the event is set.
    pub fn wait(&self) {
        if self.is_set() {
            return;
        }
        let mut guard = self.gate.lock();
        while !self.is_set() {
            self.condvar.wait(&mut guard);
        }
    }

    /// Block until the event is set or `timeout` elapses. Returns `true` if
    /// the event was observed set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.gate.lock();
        while !self.is_set() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.is_set();
            }
            let result = self.condvar.wait_for(&mut guard, remaining);
            if result.timed_out() && !self.is_set() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn int64_add_sub() {
        let counter = AtomicInt64::new(10);
        assert_eq!(counter.add(5).unwrap(), 15);
        assert_eq!(counter.sub(20).unwrap(), -5);
    }

    #[test]
    fn int64_overflow_is_reported() {
        let counter = AtomicInt64::new(i64::MAX);
        assert!(matches!(counter.add(1), Err(MapError::Overflow)));
        assert_eq!(counter.get(), i64::MAX);
    }

    #[test]
    fn int64_cas() {
        let counter = AtomicInt64::new(1);
        assert!(counter.compare_and_set(1, 2));
        assert!(!counter.compare_and_set(1, 3));
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn cell_store_and_load() {
        let guard = crossbeam_epoch::pin();
        let cell = AtomicCell::new(1usize);
        assert_eq!(cell.load(&guard).copied(), Some(1));
        cell.store(2, &guard);
        assert_eq!(cell.load(&guard).copied(), Some(2));
    }

    #[test]
    fn cell_cas() {
        let guard = crossbeam_epoch::pin();
        let cell = AtomicCell::new(1usize);
        let current = cell.load_raw(&guard);
        assert!(cell.compare_and_swap(current, 2, &guard));
        let stale = current;
        assert!(!cell.compare_and_swap(stale, 3, &guard));
    }

    #[test]
    fn event_wakes_waiters() {
        let event = Arc::new(AtomicEvent::new());
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait())
        };
        thread::sleep(Duration::from_millis(10));
        event.set();
        waiter.join().unwrap();
        assert!(event.is_set());
    }

    #[test]
    fn event_wait_timeout_expires() {
        let event = AtomicEvent::new();
        assert!(!event.wait_timeout(Duration::from_millis(5)));
        event.set();
        assert!(event.wait_timeout(Duration::from_millis(5)));
    }
}
