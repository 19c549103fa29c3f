//! The entry store: an append-only array of fixed-size entry records, grown
//! by fixed-size blocks.
//!
//! Each entry position is handed to exactly one caller by
//! [`EntryStore::allocate_entry`] and is never reused, so everything *inside*
//! an `Entry` (writing its hash and key, later installing its value) is
//! uncontended — the only concurrency inside this module is the directory's
//! growth, which follows a copy-on-write-and-retire shape: a grower builds a
//! new directory with one more block appended, CASes it in, and on a lost
//! race frees only the block it speculatively allocated, never a block some
//! other generation already published.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;
use crossbeam_epoch::{Guard, Owned};

use crate::atomic::AtomicCell;

bitflags! {
    /// Lifecycle bits of a single entry: `{empty} → RESERVED →
    /// RESERVED|INSERTED → RESERVED|INSERTED|TOMBSTONE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        /// A position has been claimed and its key/hash written.
        const RESERVED = 0b0001;
        /// A value has been installed; the mapping is live.
        const INSERTED = 0b0010;
        /// The mapping has been logically deleted.
        const TOMBSTONE = 0b0100;
        /// Marked for physical removal by the next compaction pass.
        const COMPACT = 0b1000;
    }
}

impl EntryFlags {
    /// True if this entry denotes a currently-live mapping: installed, not
    /// tombstoned.
    #[inline]
    pub fn is_live(self) -> bool {
        self.contains(EntryFlags::INSERTED) && !self.contains(EntryFlags::TOMBSTONE)
    }

    /// True if a key has been written (reservation has at least started).
    #[inline]
    pub fn is_reserved(self) -> bool {
        self.contains(EntryFlags::RESERVED)
    }
}

/// One fixed-layout record: flag byte, full hash, key (written once), value
/// (CAS-replaceable).
pub struct Entry<K, V> {
    flags: AtomicU8,
    hash: UnsafeCell<u64>,
    key: UnsafeCell<MaybeUninit<K>>,
    value: AtomicCell<V>,
}

// SAFETY: `hash`/`key` are written exactly once, by the single thread that
// owns this position (see module docs), before any `RESERVED` bit becomes
// visible to other threads (release-ordered store). Every other thread only
// reads them after observing `RESERVED` with acquire ordering, which
// synchronizes-with that release, so concurrent readers never observe a
// partially-written key or hash. `AtomicCell<V>` is `Sync` in its own right.
unsafe impl<K: Send, V: Send + Sync> Sync for Entry<K, V> {}

impl<K, V> Default for Entry<K, V> {
    fn default() -> Self {
        Self {
            flags: AtomicU8::new(0),
            hash: UnsafeCell::new(0),
            key: UnsafeCell::new(MaybeUninit::uninit()),
            value: AtomicCell::empty(),
        }
    }
}

impl<K, V> Entry<K, V> {
    /// Current flag byte.
    #[inline]
    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Claim this (never-before-touched) position for `key` under `hash`.
    /// No CAS is needed: the caller is guaranteed to be the only thread that
    /// will ever call this on this position (see module docs).
    pub fn reserve(&self, hash: u64, key: K) {
        debug_assert!(self.flags().is_empty(), "entry position reserved twice");
        unsafe {
            *self.hash.get() = hash;
            (*self.key.get()).write(key);
        }
        self.flags.store(EntryFlags::RESERVED.bits(), Ordering::Release);
    }

    /// Full hash of the installed key. Only valid once `RESERVED` is set.
    #[inline]
    pub fn hash(&self) -> u64 {
        debug_assert!(self.flags().is_reserved());
        unsafe { *self.hash.get() }
    }

    /// Borrow the key. Only valid once `RESERVED` is set (the key is never
    /// rewritten afterwards).
    #[inline]
    pub fn key(&self) -> &K {
        debug_assert!(self.flags().is_reserved());
        unsafe { (*self.key.get()).assume_init_ref() }
    }

    /// Install the value and mark the entry `INSERTED`. Must only be called
    /// once per entry, by the reserving thread, immediately after
    /// `reserve`.
    pub fn install(&self, value: V, guard: &Guard) {
        debug_assert!(self.flags().is_reserved());
        self.value.store(value, guard);
        self.flags.fetch_or(EntryFlags::INSERTED.bits(), Ordering::AcqRel);
    }

    /// Borrow the installed value, if any is currently observable.
    #[inline]
    pub fn value<'g>(&self, guard: &'g Guard) -> Option<&'g V> {
        self.value.load(guard)
    }

    /// Unconditionally replace the value (REPLACE policy / `reduce`'s fused
    /// fast paths call this after computing the new value outside the map).
    pub fn set_value(&self, value: V, guard: &Guard) {
        self.value.store(value, guard);
    }

    /// Compare-and-swap the value by reference identity of a previously
    /// loaded snapshot. Used by `compare_and_set` and by `reduce`'s CAS
    /// retry loop.
    pub fn cas_value(
        &self,
        current: crossbeam_epoch::Shared<'_, V>,
        new: V,
        guard: &Guard,
    ) -> bool {
        self.value.compare_and_swap(current, new, guard)
    }

    /// Raw pointer to the currently installed value, for passing into
    /// `cas_value`.
    pub fn value_raw<'g>(&self, guard: &'g Guard) -> crossbeam_epoch::Shared<'g, V> {
        self.value.load_raw(guard)
    }

    /// Mark this entry deleted. Idempotent.
    pub fn mark_tombstone(&self) {
        self.flags.fetch_or(EntryFlags::TOMBSTONE.bits(), Ordering::AcqRel);
    }

    /// Mark this entry for compaction (set by the compactor while building
    /// the next generation; cleared on the fresh entry it produces).
    pub fn mark_compact(&self) {
        self.flags.fetch_or(EntryFlags::COMPACT.bits(), Ordering::AcqRel);
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        if self.flags().is_reserved() {
            unsafe { ptr::drop_in_place((*self.key.get()).as_mut_ptr()) };
        }
    }
}

/// A contiguous block of `B` entries. Allocated on demand, address stable
/// for the lifetime of the store.
pub struct Block<K, V, const B: usize> {
    entries: [Entry<K, V>; B],
}

impl<K, V, const B: usize> Block<K, V, B> {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: std::array::from_fn(|_| Entry::default()),
        })
    }
}

/// Copy-on-write directory of block pointers. Growing the directory copies
/// the (cheap, `Copy`) pointers of every existing block and appends one new
/// one; it never touches the blocks themselves.
struct Directory<K, V, const B: usize> {
    blocks: Vec<*mut Block<K, V, B>>,
}

// SAFETY: the raw pointers are to heap-allocated `Block`s that are `Send +
// Sync` whenever `Entry<K, V>` is (see the `Sync` impl above); the
// `Directory` itself is only ever read through an `Atomic` behind a pin.
unsafe impl<K: Send, V: Send + Sync, const B: usize> Send for Directory<K, V, B> {}
unsafe impl<K: Send, V: Send + Sync, const B: usize> Sync for Directory<K, V, B> {}

/// Append-only store of entry records, grown by fixed-size blocks.
pub struct EntryStore<K, V, const B: usize = 64> {
    next_position: AtomicU64,
    directory: crossbeam_epoch::Atomic<Directory<K, V, B>>,
}

impl<K, V, const B: usize> Default for EntryStore<K, V, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const B: usize> EntryStore<K, V, B> {
    /// Create an empty store (no blocks allocated yet).
    pub fn new() -> Self {
        Self {
            next_position: AtomicU64::new(0),
            directory: crossbeam_epoch::Atomic::new(Directory { blocks: Vec::new() }),
        }
    }

    /// Atomically bump the position counter and ensure a block exists for
    /// the returned position, growing the directory if needed.
    pub fn allocate_entry(&self, guard: &Guard) -> u64 {
        let position = self.next_position.fetch_add(1, Ordering::AcqRel);
        self.ensure_block_for(position, guard);
        position
    }

    fn block_index(position: u64) -> usize {
        (position / B as u64) as usize
    }

    fn ensure_block_for(&self, position: u64, guard: &Guard) {
        let needed = Self::block_index(position) + 1;
        loop {
            let current = self.directory.load(Ordering::Acquire, guard);
            let current_ref = match unsafe { current.as_ref() } {
                Some(d) => d,
                None => crate::error::invariant_violation("entry directory pointer was null"),
            };
            if current_ref.blocks.len() >= needed {
                return;
            }
            let mut blocks = current_ref.blocks.clone();
            let new_block = Box::into_raw(Block::<K, V, B>::new());
            blocks.push(new_block);
            let candidate = Owned::new(Directory { blocks });
            match self.directory.compare_exchange(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    // SAFETY: no reader can still be dereferencing the old
                    // directory's *contents* to reach this new block (it
                    // isn't in them), and the old directory's own blocks are
                    // all still reachable through the winning one, so only
                    // the superseded `Directory` wrapper is retired.
                    unsafe { guard.defer_destroy(current) };
                    return;
                }
                Err(failed) => {
                    // Lost the race: free only the block we speculatively
                    // allocated, then re-read and retry.
                    let mut lost = failed.new.into_box();
                    let orphan = lost.blocks.pop().expect("we just pushed one");
                    unsafe { drop(Box::from_raw(orphan)) };
                    drop(lost);
                }
            }
        }
    }

    /// Borrow the entry at `position`. The block backing it is stable for
    /// the lifetime of `self`, so the returned reference does not need to
    /// borrow from `guard` — only the directory lookup does.
    pub fn entry_at(&self, position: u64, guard: &Guard) -> &Entry<K, V> {
        let current = self.directory.load(Ordering::Acquire, guard);
        let directory = match unsafe { current.as_ref() } {
            Some(d) => d,
            None => crate::error::invariant_violation("entry directory pointer was null"),
        };
        let block_ptr = directory.blocks[Self::block_index(position)];
        let block = unsafe { &*block_ptr };
        &block.entries[(position % B as u64) as usize]
    }

    /// Number of entry positions ever allocated (includes reserved,
    /// installed, and tombstoned entries).
    pub fn len_allocated(&self) -> u64 {
        self.next_position.load(Ordering::Acquire)
    }
}

impl<K, V, const B: usize> Drop for EntryStore<K, V, B> {
    fn drop(&mut self) {
        // No concurrent access is possible once `&mut self` is held.
        let guard = crossbeam_epoch::pin();
        let current = self.directory.load(Ordering::Acquire, &guard);
        if let Some(directory) = unsafe { current.as_ref() } {
            for &block_ptr in &directory.blocks {
                unsafe { drop(Box::from_raw(block_ptr)) };
            }
        }
        let old = self.directory.swap(crossbeam_epoch::Shared::null(), Ordering::AcqRel, &guard);
        if !old.is_null() {
            unsafe { guard.defer_destroy(old) };
        }
    }
}
