//! Grow/shrink state machine and the help-migrate protocol. A [`Generation`]
//! is one index plus a possibly-set pointer to the generation replacing it:
//!
//! - **S0 ACTIVE** — `next` is null; the generation is the map's only one.
//! - **S1 RESIZING** — `next` points at a freshly allocated, still-private
//!   generation; the map's root still points here, and every operation that
//!   touches this generation helps copy a bounded chunk of slots before
//!   proceeding.
//! - **S2 PUBLISHED** — copying finished; the map's root has been swung to
//!   `next`. This generation is reachable only by threads that loaded it
//!   before the swing; they see `MIGRATED` markers and follow `next`.
//! - **S3 RETIRED** — no root points here and no live epoch guard could
//!   still observe it; `crossbeam_epoch` frees it.
//!
//! Grounded on the resize-via-new-chunk-and-CAS shape of `Lightning`-style
//! lock-free maps (`Table`/`Chunk`/`check_resize`), adapted to this crate's
//! entry-store-plus-index split: the slot word alone
//! doesn't carry a full hash (only a truncated tag), so the copy step reads
//! each entry's stored hash from the entry store rather than recomputing a
//! new home purely from index bits.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::bits;
use crate::entry::EntryStore;
use crate::index::{robin_hood_insert, Index};

/// Grow once live occupancy exceeds this fraction of capacity.
pub const HIGH_WATER_NUM: u64 = 7;
pub const HIGH_WATER_DEN: u64 = 8;
/// Shrink once live occupancy drops below this fraction of capacity.
pub const LOW_WATER_NUM: u64 = 1;
pub const LOW_WATER_DEN: u64 = 8;
/// Number of old-generation slots one `help_migrate` call copies.
pub const COPY_CHUNK: usize = 32;

/// True if the next insertion is expected to push live occupancy over the
/// high-water mark.
pub fn should_grow(live_after_insert: u64, capacity: usize) -> bool {
    live_after_insert * HIGH_WATER_DEN > capacity as u64 * HIGH_WATER_NUM
}

/// True if live occupancy has dropped under the low-water mark and the
/// index is larger than the configured floor.
pub fn should_shrink(live: u64, capacity: usize, current_log_size: u32, min_log_size: u32) -> bool {
    current_log_size > min_log_size && live * LOW_WATER_DEN < capacity as u64 * LOW_WATER_NUM
}

/// `log_size` to grow to: double capacity (classic amortized-growth factor),
/// used also as the fallback when an insertion exceeds `MAX_DISTANCE` before
/// the occupancy-triggered threshold would have fired.
pub fn grown_log_size(current: u32) -> u32 {
    current + 1
}

/// `log_size` to shrink to: half capacity, never below `min_log_size`.
pub fn shrunk_log_size(current: u32, min_log_size: u32) -> u32 {
    current.saturating_sub(1).max(min_log_size)
}

/// One index generation plus its link to the generation replacing it.
pub struct Generation {
    pub index: Index,
    next: Atomic<Generation>,
    migrated_through: AtomicUsize,
}

impl Generation {
    /// Wrap a freshly allocated index as a new, not-yet-resizing generation.
    pub fn new(index: Index) -> Self {
        Self {
            index,
            next: Atomic::null(),
            migrated_through: AtomicUsize::new(0),
        }
    }

    /// `Some(next)` if this generation is S1/S2 (a successor exists),
    /// `None` if it is still S0 ACTIVE.
    pub fn next<'g>(&self, guard: &'g Guard) -> Option<Shared<'g, Generation>> {
        let next = self.next.load(Ordering::Acquire, guard);
        if next.is_null() {
            None
        } else {
            Some(next)
        }
    }

    /// Attempt to start a migration to a generation of `new_log_size`.
    /// Returns the new generation (freshly allocated by the caller if this
    /// call wins, or the one a racing thread already installed if it lost).
    /// Idempotent: only the first caller's allocation survives.
    pub fn start_resize<'g>(&self, new_log_size: u32, guard: &'g Guard) -> Shared<'g, Generation> {
        let candidate = Owned::new(Generation::new(Index::new(new_log_size)));
        match self
            .next
            .compare_exchange(Shared::null(), candidate, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(installed) => installed,
            Err(e) => {
                // Lost the race: someone else's generation is already
                // installed; drop our speculative one and use theirs.
                drop(e.new);
                e.current
            }
        }
    }

    /// Claim a disjoint chunk of old-generation slot indices to copy.
    /// Returns `None` once every slot has been claimed by some caller.
    pub fn claim_chunk(&self, chunk: usize) -> Option<Range<usize>> {
        let capacity = self.index.capacity();
        let start = self.migrated_through.fetch_add(chunk, Ordering::AcqRel);
        if start >= capacity {
            return None;
        }
        Some(start..capacity.min(start + chunk))
    }

    /// True once every slot in this generation has been claimed (not
    /// necessarily finished copying by the claiming thread yet, but no
    /// unclaimed work remains to hand out).
    pub fn copy_fully_claimed(&self) -> bool {
        self.migrated_through.load(Ordering::Acquire) >= self.index.capacity()
    }
}

/// Copy every occupied slot in `old`'s `range` into `new`, consulting
/// `entries` for each slot's full hash. Tombstones, empty slots, and
/// uninstalled reservations are dropped; every visited old slot is stamped
/// `MIGRATED` so stragglers reading `old` directly know to follow `next`
/// instead of treating the slot as empty or as a still-valid occupant.
pub fn copy_chunk<K, V, const B: usize>(
    old: &Index,
    new: &Index,
    entries: &EntryStore<K, V, B>,
    range: Range<usize>,
    guard: &Guard,
) {
    for i in range {
        loop {
            let word = old.load(i);
            if bits::is_migrated(word) {
                break;
            }
            if bits::is_empty(word) || bits::is_tombstone(word) {
                if old.compare_exchange(i, word, bits::MIGRATED).is_ok() {
                    break;
                }
                continue;
            }
            let position = bits::position(word);
            let tag = bits::tag(word);
            let live = entries.entry_at(position, guard).flags().is_live();
            if !live {
                if old.compare_exchange(i, word, bits::MIGRATED).is_ok() {
                    break;
                }
                continue;
            }
            let hash = entries.entry_at(position, guard).hash();
            // Claim the old slot before inserting into `new`: if this CAS
            // loses, another thread already claimed it (or it changed under
            // us), so reload and decide again rather than risk inserting the
            // same position into `new` twice.
            if old.compare_exchange(i, word, bits::MIGRATED).is_err() {
                continue;
            }
            let _ = robin_hood_insert(new, position, hash, tag);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryStore;

    #[test]
    fn should_grow_past_high_water_mark() {
        assert!(!should_grow(6, 8)); // 6/8 not > 7/8
        assert!(should_grow(8, 8));
    }

    #[test]
    fn should_shrink_below_low_water_mark_but_not_past_floor() {
        assert!(should_shrink(0, 16, 4, 3));
        assert!(!should_shrink(0, 16, 3, 3)); // already at floor
        assert!(!should_shrink(4, 16, 4, 3)); // 4/16 not below 1/8
    }

    #[test]
    fn start_resize_is_idempotent_under_racing_callers() {
        let generation = Generation::new(Index::new(3));
        let guard = crossbeam_epoch::pin();
        let a = generation.start_resize(4, &guard);
        let b = generation.start_resize(5, &guard);
        assert_eq!(a, b, "second caller must observe the first's generation");
    }

    #[test]
    fn claim_chunk_partitions_the_index_without_overlap() {
        let generation = Generation::new(Index::new(4)); // capacity 16
        let mut claimed = Vec::new();
        while let Some(range) = generation.claim_chunk(5) {
            claimed.push(range);
        }
        let mut covered: Vec<usize> = claimed.iter().flat_map(|r| r.clone()).collect();
        covered.sort_unstable();
        assert_eq!(covered, (0..16).collect::<Vec<_>>());
        assert!(generation.copy_fully_claimed());
    }

    #[test]
    fn copy_chunk_moves_live_entries_and_stamps_migrated() {
        let old = Index::new(3); // capacity 8
        let new = Index::new(3);
        let entries: EntryStore<u64, u64, 8> = EntryStore::new();
        let guard = crossbeam_epoch::pin();

        let position = entries.allocate_entry(&guard);
        let hash = 0x2000_0000_0000_0000u64; // home = 2 at log_size 3
        entries.entry_at(position, &guard).reserve(hash, 42);
        entries.entry_at(position, &guard).install(99, &guard);
        let tag = bits::tag_of(hash);
        old.store_unsynchronized(old.home(hash), bits::for_position(position, tag, 0));

        copy_chunk(&old, &new, &entries, 0..old.capacity(), &guard);

        assert!(bits::is_migrated(old.load(old.home(hash))));
        let new_word = new.load(new.home(hash));
        assert_eq!(bits::position(new_word), position);
    }

    #[test]
    fn copy_chunk_drops_tombstones_and_dangling_reservations() {
        let old = Index::new(3);
        let new = Index::new(3);
        let entries: EntryStore<u64, u64, 8> = EntryStore::new();
        let guard = crossbeam_epoch::pin();

        // A tombstoned key.
        let tombstoned = entries.allocate_entry(&guard);
        let hash_a = 0x1000_0000_0000_0000u64;
        entries.entry_at(tombstoned, &guard).reserve(hash_a, 1);
        entries.entry_at(tombstoned, &guard).install(1, &guard);
        entries.entry_at(tombstoned, &guard).mark_tombstone();
        old.store_unsynchronized(
            old.home(hash_a),
            bits::for_position(tombstoned, bits::tag_of(hash_a), 0),
        );

        // A reservation that never got installed.
        let dangling = entries.allocate_entry(&guard);
        let hash_b = 0x4000_0000_0000_0000u64;
        entries.entry_at(dangling, &guard).reserve(hash_b, 2);
        old.store_unsynchronized(
            old.home(hash_b),
            bits::for_position(dangling, bits::tag_of(hash_b), 0),
        );

        copy_chunk(&old, &new, &entries, 0..old.capacity(), &guard);

        for i in 0..new.capacity() {
            assert!(!bits::is_occupied(new.load(i)));
        }
    }
}
