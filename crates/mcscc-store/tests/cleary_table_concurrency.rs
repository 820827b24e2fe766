//! Cleary table correctness under concurrent insertion.
//!
//!   1. Identical key from many threads: one reference, one insert
//!   2. Disjoint keys from many threads: distinct dense references
//!   3. Overlapping key sets: every thread agrees on every reference
//!   4. Interned states stay readable from all threads
//!   5. Sequential behaviour matches a map model (proptest)

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;

use mcscc_store::{ClearyTable, FindOrPut, StateStore};
use mcscc_types::StateRef;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

fn spread(i: u64) -> u64 {
    i.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17)
}

// ---------------------------------------------------------------------------
// Test 1: Identical key
// ---------------------------------------------------------------------------

#[test]
fn test_identical_key_single_reference() {
    const THREADS: usize = 8;
    let table = Arc::new(ClearyTable::new(12).unwrap());
    // Occupy the neighbourhood so some callers take the cluster path.
    for rem in 0..3_u64 {
        table.find_or_put((500 << 28) | rem, true).unwrap();
    }
    let before = table.occupied_slots();
    let barrier = Arc::new(Barrier::new(THREADS));
    let key = (500_u64 << 28) | 0x0AB_CDEF;

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let t = Arc::clone(&table);
            let b = Arc::clone(&barrier);
            thread::spawn(move || {
                b.wait();
                t.find_or_put(key, true).unwrap()
            })
        })
        .collect();
    let outcomes: Vec<FindOrPut> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let inserted = outcomes.iter().filter(|o| o.is_inserted()).count();
    let refs: HashSet<StateRef> = outcomes.iter().filter_map(|o| o.state_ref()).collect();
    assert_eq!(inserted, 1, "exactly one caller inserts");
    assert_eq!(refs.len(), 1, "all callers see the same reference");
    assert_eq!(table.occupied_slots(), before + 1);
    println!("[PASS] identical key from {THREADS} threads: one reference, one slot");
}

#[test]
fn test_identical_empty_home_single_reference() {
    const THREADS: usize = 8;
    let table = Arc::new(ClearyTable::new(10).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));
    let key = (77_u64 << 28) | 5;

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let t = Arc::clone(&table);
            let b = Arc::clone(&barrier);
            thread::spawn(move || {
                b.wait();
                t.find_or_put(key, true).unwrap()
            })
        })
        .collect();
    let outcomes: Vec<FindOrPut> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(outcomes.iter().filter(|o| o.is_inserted()).count(), 1);
    assert!(
        outcomes
            .iter()
            .all(|o| o.state_ref() == Some(StateRef::new(0)))
    );
    assert_eq!(table.occupied_slots(), 1);
    println!("[PASS] identical key on an empty home slot");
}

// ---------------------------------------------------------------------------
// Test 2: Disjoint keys
// ---------------------------------------------------------------------------

#[test]
fn test_disjoint_keys_dense_references() {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 2_000;
    let table = Arc::new(ClearyTable::new(16).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|w| {
            let t = Arc::clone(&table);
            let b = Arc::clone(&barrier);
            thread::spawn(move || {
                b.wait();
                (0..PER_THREAD)
                    .map(|i| {
                        let k = spread(w * PER_THREAD + i);
                        (k, t.find_or_put(k, true).unwrap())
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut refs = HashSet::new();
    let mut by_key = HashMap::new();
    for h in handles {
        for (k, outcome) in h.join().unwrap() {
            assert!(outcome.is_inserted(), "disjoint key {k:#x} found");
            let r = outcome.state_ref().unwrap();
            assert!(refs.insert(r), "reference {r} issued twice");
            by_key.insert(k, r);
        }
    }

    let total = (THREADS * PER_THREAD) as usize;
    assert_eq!(table.len(), total);
    assert_eq!(table.occupied_slots(), total);
    assert!(refs.iter().all(|r| r.index() < total));
    for (k, r) in by_key {
        assert_eq!(table.find_or_put(k, false).unwrap(), FindOrPut::Found(r));
    }
    println!("[PASS] disjoint keys: {total} distinct dense references");
}

// ---------------------------------------------------------------------------
// Test 3: Overlapping key sets
// ---------------------------------------------------------------------------

#[test]
fn test_overlapping_keys_agree() {
    const THREADS: usize = 6;
    const KEYS: u64 = 3_000;
    let table = Arc::new(ClearyTable::new(15).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|w| {
            let t = Arc::clone(&table);
            let b = Arc::clone(&barrier);
            thread::spawn(move || {
                b.wait();
                // Each thread walks the keys in a different order.
                let offset = (w as u64) * 499;
                let mut seen = HashMap::new();
                let mut inserts = 0_usize;
                for i in 0..KEYS {
                    let k = spread((i + offset) % KEYS);
                    let outcome = t.find_or_put(k, true).unwrap();
                    inserts += usize::from(outcome.is_inserted());
                    seen.insert(k, outcome.state_ref().unwrap());
                }
                (seen, inserts)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let total_inserts: usize = results.iter().map(|(_, n)| n).sum();
    assert_eq!(total_inserts, KEYS as usize, "each key inserted exactly once");
    let (first, _) = &results[0];
    for (seen, _) in &results[1..] {
        assert_eq!(seen, first, "threads disagree on a reference");
    }
    assert_eq!(table.len(), KEYS as usize);
    println!("[PASS] overlapping keys: {THREADS} threads agree on {KEYS} references");
}

// ---------------------------------------------------------------------------
// Test 4: State store under contention
// ---------------------------------------------------------------------------

#[test]
fn test_state_store_concurrent_interning() {
    const THREADS: usize = 4;
    let store: Arc<StateStore<Vec<u16>>> = Arc::new(StateStore::new(14).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let s = Arc::clone(&store);
            let b = Arc::clone(&barrier);
            thread::spawn(move || {
                b.wait();
                (0..1_000_u16)
                    .map(|i| {
                        let state = vec![i, i ^ 0x55, 7];
                        // A weak hash forces salted probing.
                        let hash = u64::from(i % 512);
                        s.find_or_put(&state, hash).unwrap().0
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let results: Vec<Vec<StateRef>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for other in &results[1..] {
        assert_eq!(other, &results[0]);
    }
    assert_eq!(store.len(), 1_000);
    for (i, r) in results[0].iter().enumerate() {
        let i = i as u16;
        assert_eq!(store.get(*r), Some(&vec![i, i ^ 0x55, 7]));
    }
    println!("[PASS] state store: 4 threads intern 1000 colliding states consistently");
}

// ---------------------------------------------------------------------------
// Test 5: Sequential model check
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_matches_map_model(
        ops in prop::collection::vec((0_u64..48, 0_u64..16, any::<bool>()), 1..200)
    ) {
        // Few homes and remainders: dense clusters, many shifts.
        let table = ClearyTable::with_threshold(10, 512).unwrap();
        let mut model: HashMap<u64, StateRef> = HashMap::new();
        for (home, rem, insert) in ops {
            let key = ((home + 200) << 28) | rem;
            let outcome = table.find_or_put(key, insert).unwrap();
            match model.get(&key) {
                Some(r) => prop_assert_eq!(outcome, FindOrPut::Found(*r)),
                None if insert => {
                    let FindOrPut::Inserted(r) = outcome else {
                        return Err(TestCaseError::fail(format!("{key:#x} not inserted")));
                    };
                    prop_assert_eq!(r.index(), model.len());
                    model.insert(key, r);
                }
                None => prop_assert_eq!(outcome, FindOrPut::NotFound),
            }
        }
        prop_assert_eq!(table.occupied_slots(), model.len());
        for (key, r) in &model {
            prop_assert_eq!(table.find_or_put(*key, false).unwrap(), FindOrPut::Found(*r));
        }
    }
}
