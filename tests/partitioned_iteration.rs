//! Partitioned iteration under no concurrent mutation: a fixed pool of
//! worker threads each drains one partition via `fast_iter`, with
//! `this_partition` equal to the worker's index, mirroring a thread-pool
//! driven partitioned scan. Every live key must be yielded by exactly one
//! partition.

use std::collections::HashSet;
use std::sync::Mutex;

use rhindex::ConcurrentMap;

const KEY_COUNT: u64 = 1 << 15;

#[test]
fn every_live_key_is_covered_exactly_once_across_partitions() {
    let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(None);
    for k in 0..KEY_COUNT {
        map.set(k, k);
    }

    for partitions in [1u64, 2, 3, 4] {
        let seen: Mutex<Vec<u64>> = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for this_partition in 0..partitions {
                let map = &map;
                let seen = &seen;
                scope.spawn(move || {
                    let iter = map.fast_iter(partitions, this_partition).unwrap();
                    let keys: Vec<u64> = iter.map(|(k, _v)| k).collect();
                    seen.lock().unwrap().extend(keys);
                });
            }
        });
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len() as u64, KEY_COUNT, "partitions={partitions} dropped or duplicated a key");
        let unique: HashSet<u64> = seen.into_iter().collect();
        assert_eq!(unique.len() as u64, KEY_COUNT, "partitions={partitions} yielded a key more than once");
    }
}
