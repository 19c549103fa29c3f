//! Partitioned iteration over live entries: splitting the entry store's
//! allocated-position range into `partitions` contiguous, disjoint chunks
//! lets independent workers each own a chunk with no coordination, the same
//! shape `map.rs`'s `fast_iter` exposes publicly.

use crossbeam_epoch::Guard;

use crate::entry::EntryStore;

/// Iterator over the live `(key, value)` pairs whose entry position falls in
/// this worker's share of `partitions`. Concatenating every partition's
/// output (in any order) yields every live pair exactly once; no partition
/// observes a position outside its own range, so multiple partitions can run
/// on independent threads without synchronizing against each other.
pub struct PartitionIter<'a, K, V, const B: usize> {
    entries: &'a EntryStore<K, V, B>,
    guard: Guard,
    next: u64,
    end: u64,
}

impl<'a, K, V, const B: usize> PartitionIter<'a, K, V, B> {
    pub(crate) fn new(entries: &'a EntryStore<K, V, B>, partitions: u64, this_partition: u64) -> Self {
        let allocated = entries.len_allocated();
        let chunk = allocated.div_ceil(partitions);
        let start = (this_partition * chunk).min(allocated);
        let end = ((this_partition + 1) * chunk).min(allocated);
        Self {
            entries,
            guard: crossbeam_epoch::pin(),
            next: start,
            end,
        }
    }
}

impl<'a, K, V, const B: usize> Iterator for PartitionIter<'a, K, V, B>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.end {
            let position = self.next;
            self.next += 1;
            let entry = self.entries.entry_at(position, &self.guard);
            if !entry.flags().is_live() {
                continue;
            }
            if let Some(value) = entry.value(&self.guard) {
                return Some((entry.key().clone(), value.clone()));
            }
        }
        None
    }
}
