//! Grow-then-shrink round trip: insert a working set, delete it, insert a
//! disjoint working set further up the key space, then delete that too —
//! `approx_len`/`len_bounds` should track occupancy through both resizes.

use rhindex::ConcurrentMap;

#[test]
fn tracks_occupancy_across_two_resize_cycles() {
    let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(None);

    for k in 0..(1 << 10) {
        map.set(k, k);
    }
    assert_eq!(map.approx_len(), 1 << 10);

    for k in 0..(1 << 10) {
        map.delete(&k).unwrap();
    }
    assert_eq!(map.len_bounds(), (0, 0));

    let base = 1u64 << 16;
    let span = 1u64 << 12;
    for k in base..base + span {
        map.set(k, k * 2);
    }
    assert_eq!(map.approx_len(), span);
    for k in base..base + span {
        assert_eq!(map.get(&k), Some(k * 2));
    }

    for k in base..base + span {
        map.delete(&k).unwrap();
    }
    assert_eq!(map.len_bounds(), (0, 0));
}
