//! Union-find behaviour under concurrent claims, unions and removals.
//!
//!   1. Racing claims: one `First` per reference, every worker recorded
//!   2. Racing unions: final partition equals the sequential one
//!   3. Monotonicity: a true `same_set` never turns false
//!   4. Racing removals and picks: every set marked dead exactly once
//!   5. Finds racing unions that re-root the path being split
//!   6. Claims racing unions: no worker bit lost by a merge
//!
//! Every test runs under a watchdog so a livelock fails instead of hanging.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use mcscc_engine::{Claim, Pick, UnionFind};
use mcscc_types::{StateRef, WorkerId};

const NODES: u32 = 512;

const WATCHDOG: Duration = Duration::from_secs(60);

fn r(x: u32) -> StateRef {
    StateRef::new(x)
}

/// Run `body` on its own thread; panic if it is still running after
/// [`WATCHDOG`].
fn with_watchdog<T, F>(name: &str, body: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let out = body();
        tx.send(()).ok();
        out
    });
    match rx.recv_timeout(WATCHDOG) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => handle
            .join()
            .unwrap_or_else(|payload| std::panic::resume_unwind(payload)),
        Err(RecvTimeoutError::Timeout) => panic!("{name}: no progress within {WATCHDOG:?}"),
    }
}

/// Every parent chain ends in a root, and all members agree on it.
fn assert_forest(uf: &UnionFind) {
    for x in 0..NODES {
        let root = uf.find(r(x));
        assert_eq!(uf.find(root), root, "#{x} resolved to non-root {root}");
    }
}

/// Deterministic pair stream for thread `seed`.
fn pairs(seed: u64, count: usize) -> Vec<(u32, u32)> {
    let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..count)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let a = (x % u64::from(NODES)) as u32;
            let b = ((x >> 32) % u64::from(NODES)) as u32;
            (a, b)
        })
        .collect()
}

fn claimed_all() -> Arc<UnionFind> {
    let uf = UnionFind::new(NODES as usize);
    let w0 = WorkerId::new(0).unwrap();
    for x in 0..NODES {
        uf.claim(r(x), w0, || false);
    }
    Arc::new(uf)
}

/// Sequential reference partition.
fn sequential_roots(unions: &[(u32, u32)]) -> Vec<usize> {
    fn find(parent: &mut [usize], x: usize) -> usize {
        let mut root = x;
        while parent[root] != root {
            root = parent[root];
        }
        parent[x] = root;
        root
    }
    let mut parent: Vec<usize> = (0..NODES as usize).collect();
    for &(a, b) in unions {
        let ra = find(&mut parent, a as usize);
        let rb = find(&mut parent, b as usize);
        parent[ra] = rb;
    }
    (0..NODES as usize).map(|x| find(&mut parent, x)).collect()
}

// ---------------------------------------------------------------------------
// Test 1: Racing claims
// ---------------------------------------------------------------------------

#[test]
fn test_racing_claims_single_first() {
    with_watchdog("racing claims single first", || {
        const THREADS: usize = 8;
        let uf = Arc::new(UnionFind::new(NODES as usize));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|w| {
                let uf = Arc::clone(&uf);
                let b = Arc::clone(&barrier);
                thread::spawn(move || {
                    let id = WorkerId::new(w).unwrap();
                    b.wait();
                    let mut firsts = Vec::new();
                    for x in 0..NODES {
                        match uf.claim(r(x), id, || x % 3 == 0) {
                            Claim::First => firsts.push(x),
                            Claim::Success => {}
                            other => panic!("unexpected {other:?} for #{x}"),
                        }
                    }
                    firsts
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for x in h.join().unwrap() {
                assert!(seen.insert(x), "#{x} claimed first twice");
            }
        }
        assert_eq!(seen.len(), NODES as usize);
        for x in 0..NODES {
            assert_eq!(uf.workers(r(x)), (1 << THREADS) - 1);
            assert_eq!(uf.is_accepting(r(x)), x % 3 == 0);
        }
        println!("[PASS] racing claims: one First per reference, {THREADS} workers recorded");
    });
}

// ---------------------------------------------------------------------------
// Test 2 + 3: Racing unions and monotonicity
// ---------------------------------------------------------------------------

#[test]
fn test_racing_unions_match_sequential_partition() {
    with_watchdog("racing unions match sequential partition", || {
        const THREADS: usize = 6;
        const PER_THREAD: usize = 120;
        let uf = claimed_all();
        let barrier = Arc::new(Barrier::new(THREADS + 1));
        let done = Arc::new(AtomicBool::new(false));

        let observer = {
            let uf = Arc::clone(&uf);
            let b = Arc::clone(&barrier);
            let d = Arc::clone(&done);
            thread::spawn(move || {
                b.wait();
                let probes = pairs(99, 64);
                let mut united: HashSet<(u32, u32)> = HashSet::new();
                while !d.load(Ordering::Acquire) {
                    for &(a, c) in &probes {
                        if uf.same_set(r(a), r(c)) {
                            united.insert((a, c));
                        }
                    }
                    for &(a, c) in &united {
                        assert!(uf.same_set(r(a), r(c)), "#{a} and #{c} separated");
                    }
                }
                united.len()
            })
        };

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let uf = Arc::clone(&uf);
                let b = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mine = pairs(t as u64 + 1, PER_THREAD);
                    b.wait();
                    for &(a, c) in &mine {
                        uf.union(r(a), r(c));
                        assert!(uf.same_set(r(a), r(c)));
                    }
                    mine
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        done.store(true, Ordering::Release);
        let observed = observer.join().unwrap();

        assert_forest(&uf);
        let expected = sequential_roots(&all);
        for a in 0..NODES {
            for c in (a + 1..NODES).step_by(7) {
                assert_eq!(
                    uf.same_set(r(a), r(c)),
                    expected[a as usize] == expected[c as usize],
                    "#{a} vs #{c}"
                );
            }
        }
        println!("[PASS] racing unions: partition matches, {observed} monotone observations");
    });
}

// ---------------------------------------------------------------------------
// Test 4: Racing removals and picks
// ---------------------------------------------------------------------------

#[test]
fn test_every_set_dies_once() {
    with_watchdog("every set dies once", || {
        const THREADS: usize = 4;
        let uf = claimed_all();
        let unions = pairs(7, 300);
        for &(a, c) in &unions {
            uf.union(r(a), r(c));
        }
        let sets: HashSet<usize> = sequential_roots(&unions).into_iter().collect();
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let uf = Arc::clone(&uf);
                let b = Arc::clone(&barrier);
                thread::spawn(move || {
                    b.wait();
                    let mut marked = 0_usize;
                    // Each thread removes its share, then everyone keeps picking
                    // until all states are dead.
                    for x in (t as u32..NODES).step_by(THREADS) {
                        uf.remove_from_list(r(x));
                    }
                    for x in 0..NODES {
                        while !uf.is_dead(r(x)) {
                            if uf.is_in_list(r(x)) {
                                thread::yield_now();
                                continue;
                            }
                            match uf.pick_from_list(r(x)) {
                                Pick::MarkedDead => marked += 1,
                                Pick::Dead => {}
                                Pick::Live(_) => thread::yield_now(),
                            }
                        }
                    }
                    marked
                })
            })
            .collect();

        let marked: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(marked, sets.len());
        assert!((0..NODES).all(|x| uf.is_dead(r(x)) && !uf.is_in_list(r(x))));
        println!("[PASS] removals: {} sets, each marked dead exactly once", sets.len());
    });
}

// ---------------------------------------------------------------------------
// Test 5: Finds racing re-rooting unions
// ---------------------------------------------------------------------------

#[test]
fn test_finds_race_rerooting_unions() {
    with_watchdog("finds race re-rooting unions", || {
        const TREE: u32 = 8;
        const FINDERS: usize = 4;
        const UNIONERS: usize = 2;
        let uf = claimed_all();
        // Binomial trees of TREE nodes, each rooted at the last index of its
        // block, with paths of depth 3.
        for base in (0..NODES).step_by(TREE as usize) {
            let mut step = 1;
            while step < TREE {
                for x in (base..base + TREE).step_by(2 * step as usize) {
                    uf.union(r(x + step - 1), r(x + 2 * step - 1));
                }
                step *= 2;
            }
        }
        let barrier = Arc::new(Barrier::new(FINDERS + UNIONERS));
        let round = Arc::new(Barrier::new(UNIONERS));
        let done = Arc::new(AtomicBool::new(false));

        let finders: Vec<_> = (0..FINDERS)
            .map(|t| {
                let uf = Arc::clone(&uf);
                let b = Arc::clone(&barrier);
                let d = Arc::clone(&done);
                thread::spawn(move || {
                    b.wait();
                    let mut finds = 0_u64;
                    while !d.load(Ordering::Acquire) {
                        for x in (t as u32..NODES).step_by(FINDERS) {
                            let base = x - x % TREE;
                            assert!(uf.same_set(r(x), r(base)), "#{x} left its tree");
                            finds += 1;
                        }
                    }
                    finds
                })
            })
            .collect();

        // Equal-rank tournament: every round hangs one tree root below
        // another while the finders are splitting paths through it.
        let unioners: Vec<_> = (0..UNIONERS)
            .map(|t| {
                let uf = Arc::clone(&uf);
                let b = Arc::clone(&barrier);
                let round = Arc::clone(&round);
                thread::spawn(move || {
                    b.wait();
                    let mut span = TREE;
                    while span < NODES {
                        for (i, lo) in (0..NODES).step_by(2 * span as usize).enumerate() {
                            if i % UNIONERS == t {
                                uf.union(r(lo + span - 1), r(lo + 2 * span - 1));
                            }
                        }
                        round.wait();
                        span *= 2;
                    }
                })
            })
            .collect();

        for h in unioners {
            h.join().unwrap();
        }
        done.store(true, Ordering::Release);
        let finds: u64 = finders.into_iter().map(|h| h.join().unwrap()).sum();

        assert_forest(&uf);
        let root = uf.find(r(0));
        assert!((0..NODES).all(|x| uf.find(r(x)) == root));
        println!("[PASS] finds vs re-rooting unions: acyclic forest after {finds} finds");
    });
}

// ---------------------------------------------------------------------------
// Test 6: Claims racing unions
// ---------------------------------------------------------------------------

#[test]
fn test_claims_racing_unions_keep_worker_bits() {
    with_watchdog("claims racing unions keep worker bits", || {
        const CLAIMERS: usize = 6;
        let uf = claimed_all();
        let unions = pairs(31, 600);
        let barrier = Arc::new(Barrier::new(CLAIMERS + 1));

        let unioner = {
            let uf = Arc::clone(&uf);
            let b = Arc::clone(&barrier);
            thread::spawn(move || {
                b.wait();
                for &(a, c) in &unions {
                    uf.union(r(a), r(c));
                }
            })
        };
        let claimers: Vec<_> = (1..=CLAIMERS)
            .map(|w| {
                let uf = Arc::clone(&uf);
                let b = Arc::clone(&barrier);
                thread::spawn(move || {
                    let id = WorkerId::new(w).unwrap();
                    b.wait();
                    for i in 0..NODES {
                        let x = (i * 7 + w as u32 * 61) % NODES;
                        match uf.claim(r(x), id, || unreachable!()) {
                            Claim::Success | Claim::Found => {}
                            other => panic!("unexpected {other:?} for #{x}"),
                        }
                    }
                })
            })
            .collect();

        unioner.join().unwrap();
        for h in claimers {
            h.join().unwrap();
        }

        let everyone = (1_u64 << (CLAIMERS + 1)) - 1;
        for x in 0..NODES {
            assert_eq!(uf.workers(r(x)), everyone, "worker bit lost on #{x}");
        }
        assert_forest(&uf);
        println!("[PASS] claims vs unions: {CLAIMERS} worker bits on every root");
    });
}
