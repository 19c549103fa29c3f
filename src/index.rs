//! The index: a power-of-two array of slot words, operated on by single-word
//! CAS. One `Index` is one generation; `migration.rs`
//! owns swapping the map's current generation pointer to a new `Index`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::bits;
use crate::error::MapError;

/// One generation of the index: a fixed-size slot-word array plus the
/// `log_size` that determines both its capacity and the home-slot
/// computation's shift amount.
pub struct Index {
    slots: Box<[AtomicU64]>,
    log_size: u32,
}

impl Index {
    /// Minimum `log_size` a freshly constructed map ever starts at.
    pub const MIN_LOG_SIZE: u32 = 3;

    /// Allocate a new, all-EMPTY generation with `1 << log_size` slots.
    pub fn new(log_size: u32) -> Self {
        let capacity = 1usize << log_size;
        let slots = (0..capacity).map(|_| AtomicU64::new(bits::EMPTY)).collect();
        Self { slots, log_size }
    }

    /// `log_size` of this generation.
    #[inline]
    pub fn log_size(&self) -> u32 {
        self.log_size
    }

    /// Number of slots, `1 << log_size`.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Home slot for a 64-bit hash: its top `log_size` bits.
    #[inline]
    pub fn home(&self, hash: u64) -> usize {
        (hash >> (64 - self.log_size)) as usize
    }

    /// Advance a probe index by one step, wrapping modulo capacity.
    #[inline]
    pub fn step(&self, index: usize) -> usize {
        (index + 1) & (self.capacity() - 1)
    }

    /// Load the slot word at `index` with acquire ordering.
    #[inline]
    pub fn load(&self, index: usize) -> u64 {
        self.slots[index].load(Ordering::Acquire)
    }

    /// Compare-and-swap the slot word at `index`.
    #[inline]
    pub fn compare_exchange(&self, index: usize, current: u64, new: u64) -> Result<u64, u64> {
        self.slots[index].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Unconditionally overwrite a slot. Only safe during construction of a
    /// generation not yet published (migration's copy phase), or when the
    /// caller otherwise has exclusive access.
    #[inline]
    pub fn store_unsynchronized(&self, index: usize, word: u64) {
        self.slots[index].store(word, Ordering::Release);
    }

    /// Smallest `log_size` whose capacity can hold `min_capacity` live
    /// entries without exceeding the high-water fraction on the first
    /// insert.
    pub fn log_size_for_capacity(min_capacity: u64, high_water_num: u64, high_water_den: u64) -> u32 {
        let mut log_size = Self::MIN_LOG_SIZE;
        while ((1u64 << log_size) * high_water_num) / high_water_den < min_capacity {
            log_size += 1;
        }
        log_size
    }
}

/// Insert `(position, hash, tag)` into `index` using linear, Robin-Hood
/// preserving insertion, starting its probe at `index.home(hash)`. This is
/// the copy-phase primitive migration uses to repopulate a fresh generation:
/// the old generation has already deduplicated keys, so no key-equality
/// check is needed here. `map.rs`'s live insert path has its own loop built
/// from `Index`'s primitives directly, since it additionally has to resolve
/// same-key collisions against the entry store.
///
/// Returns the number of probe steps taken (for distance-exceeded checks).
pub fn robin_hood_insert(index: &Index, position: u64, hash: u64, tag: u64) -> Result<u32, MapError> {
    let mut carrier_position = position;
    let mut carrier_tag = tag;
    let mut slot = index.home(hash);
    let mut distance: u64 = 0;

    loop {
        if distance > bits::MAX_DISTANCE {
            return Err(MapError::InvalidArgument(
                "probe distance exceeded during migration copy".to_string(),
            ));
        }
        let current = index.load(slot);
        if bits::is_empty(current) || bits::is_tombstone(current) {
            let word = bits::for_position(carrier_position, carrier_tag, distance);
            match index.compare_exchange(slot, current, word) {
                Ok(_) => return Ok(distance as u32),
                Err(_) => continue, // reload and retry this slot
            }
        }
        let existing_distance = bits::distance(current);
        if existing_distance < distance {
            // Displace: steal this slot for our carrier, continue carrying
            // the displaced occupant further down the probe sequence.
            let word = bits::for_position(carrier_position, carrier_tag, distance);
            match index.compare_exchange(slot, current, word) {
                Ok(_) => {
                    carrier_position = bits::position(current);
                    carrier_tag = bits::tag(current);
                    distance = existing_distance;
                }
                Err(_) => continue,
            }
        }
        slot = index.step(slot);
        distance += 1;
    }
}
