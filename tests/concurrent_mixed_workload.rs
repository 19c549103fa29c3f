//! Concurrent mixed workload: several threads each insert their own
//! disjoint key range while doing random lookups into a key range shared
//! with every other thread. After all threads join, every inserted key must
//! be present and the index's Robin-Hood probing invariants must still
//! hold.
//!
//! Requires `--features introspect` for the invariant check; without it
//! this test only exercises the presence assertions.

use std::sync::Arc;
use std::thread;

use rand::{Rng, SeedableRng};
use rhindex::ConcurrentMap;

const THREADS: u64 = 4;
const PER_THREAD: u64 = 5_000;
const SHARED_RANGE: u64 = 64;

#[test]
fn every_inserted_key_survives_concurrent_inserts_and_lookups() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let map: Arc<ConcurrentMap<u64, u64>> = Arc::new(ConcurrentMap::new(None));
    // seed the range every thread will also read from concurrently
    for k in 0..SHARED_RANGE {
        map.set(k, k);
    }

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = map.clone();
            thread::spawn(move || {
                let base = (t + 1) * 1_000_000;
                let mut rng = rand::rngs::StdRng::seed_from_u64(0x2545F4914F6CDD1Du64 ^ t);
                for i in 0..PER_THREAD {
                    let key = base + i;
                    map.set(key, key);
                    let _ = map.get(&rng.gen_range(0..SHARED_RANGE));
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    for t in 0..THREADS {
        let base = (t + 1) * 1_000_000;
        for i in 0..PER_THREAD {
            let key = base + i;
            assert_eq!(map.get(&key), Some(key), "thread {t}'s key {key} went missing");
        }
    }

    #[cfg(feature = "introspect")]
    {
        assert_eq!(rhindex::debug_introspection::check_invariants(&*map), Ok(()));
    }
}
