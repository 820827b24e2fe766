//! Concurrent union-find over state references.
//!
//! One node per reference slot. Besides the usual parent/rank forest every
//! node carries:
//!
//! - a *worker set*: the bitmask of workers that have visited the node's
//!   component (authoritative on the root only);
//! - a *list link*: all members of a component form one cyclic list, and a
//!   member leaves the list (becomes a tombstone) once its successors have
//!   been fully explored. A component whose list holds only tombstones is
//!   complete and can be marked dead;
//! - an *accepting* flag, OR-ed into the root on every union.
//!
//! ## Protocol
//!
//! Union locks both roots (lowest reference first) by moving their status
//! from `LIVE` to `LOCKED`, re-checks that both are still roots, merges the
//! two cyclic lists by swapping one `next` link of a live member on each
//! side, then hangs the lower-ranked root below the other. `find`
//! splits paths with a CAS that only ever moves a node to its current
//! grandparent, so it never lowers a link or rewrites a root.
//!
//! `dead` is set on a root only and is never cleared; unions never split a
//! set, so `same_set` answers that were once true stay true.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use mcscc_store::Backoff;
use mcscc_types::{StateRef, WorkerId};

// ---------------------------------------------------------------------------
// Node encoding
// ---------------------------------------------------------------------------

/// Union-find status of a node.
mod uf_status {
    pub const UNSEEN: u8 = 0;
    /// Claimed by a worker that is still initializing the node.
    pub const INIT: u8 = 1;
    pub const LIVE: u8 = 2;
    /// Root held by a union in progress.
    pub const LOCKED: u8 = 3;
    pub const DEAD: u8 = 4;
}

/// List status of a node.
mod list_status {
    pub const LIVE: u8 = 0;
    /// Being relinked by a list merge.
    pub const BUSY: u8 = 1;
    pub const TOMBSTONE: u8 = 2;
}

#[derive(Debug)]
struct UfNode {
    w_set: AtomicU64,
    parent: AtomicU32,
    list_next: AtomicU32,
    rank: AtomicU8,
    uf_status: AtomicU8,
    list_status: AtomicU8,
    accepting: AtomicBool,
}

impl UfNode {
    fn new(index: u32) -> Self {
        Self {
            w_set: AtomicU64::new(0),
            parent: AtomicU32::new(index),
            list_next: AtomicU32::new(index),
            rank: AtomicU8::new(0),
            uf_status: AtomicU8::new(uf_status::UNSEEN),
            list_status: AtomicU8::new(list_status::LIVE),
            accepting: AtomicBool::new(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of [`UnionFind::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller is the first worker to see the state anywhere.
    First,
    /// The state was known, but not yet to this worker.
    Success,
    /// This worker already visited the state's component.
    Found,
    /// The state's component is complete.
    Dead,
}

/// Result of [`UnionFind::pick_from_list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// A member of the component that still has unexplored successors.
    Live(StateRef),
    /// The component was already dead.
    Dead,
    /// The list was empty and this call marked the component dead.
    MarkedDead,
}

// ---------------------------------------------------------------------------
// UnionFind
// ---------------------------------------------------------------------------

/// Shared union-find with per-component still-explorable lists.
pub struct UnionFind {
    nodes: Box<[UfNode]>,
}

impl UnionFind {
    /// Structure for references `0..len`.
    ///
    /// # Panics
    ///
    /// Panics if `len` does not fit a 32-bit reference.
    #[must_use]
    pub fn new(len: usize) -> Self {
        assert!(
            u32::try_from(len).is_ok(),
            "union-find size {len} exceeds the reference range"
        );
        let nodes = (0..len as u32).map(UfNode::new).collect();
        tracing::debug!(target: "mcscc.uf", nodes = len, "union-find created");
        Self { nodes }
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the structure has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Bytes held by the node array.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.nodes.len() * std::mem::size_of::<UfNode>()
    }

    #[inline]
    fn node(&self, x: u32) -> &UfNode {
        &self.nodes[x as usize]
    }

    #[inline]
    fn parent(&self, x: u32) -> u32 {
        self.node(x).parent.load(Ordering::Acquire)
    }

    #[inline]
    fn status(&self, x: u32) -> u8 {
        self.node(x).uf_status.load(Ordering::Acquire)
    }

    #[inline]
    fn list_next(&self, x: u32) -> u32 {
        self.node(x).list_next.load(Ordering::Acquire)
    }

    #[inline]
    fn list_status(&self, x: u32) -> u8 {
        self.node(x).list_status.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Claim `r` for `worker`.
    ///
    /// The first claimer initializes the node and records the state's
    /// accepting flag from `accepting`, which is not called otherwise. A
    /// later claimer adds itself to the worker set of the component root.
    pub fn claim(&self, r: StateRef, worker: WorkerId, accepting: impl FnOnce() -> bool) -> Claim {
        let node = self.node(r.get());
        let mask = worker.mask();
        if node
            .uf_status
            .compare_exchange(
                uf_status::UNSEEN,
                uf_status::INIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            node.accepting.store(accepting(), Ordering::Relaxed);
            node.w_set.store(mask, Ordering::Relaxed);
            node.uf_status.store(uf_status::LIVE, Ordering::Release);
            return Claim::First;
        }

        let mut backoff = Backoff::new();
        while node.uf_status.load(Ordering::Acquire) == uf_status::INIT {
            backoff.snooze();
        }

        let mut f = self.find(r).get();
        if self.is_dead(StateRef::new(f)) {
            return Claim::Dead;
        }
        if self.node(f).w_set.load(Ordering::Acquire) & mask != 0 {
            return Claim::Found;
        }
        self.node(f).w_set.fetch_or(mask, Ordering::SeqCst);

        // Follow the root until the worker bit sits on a stable, unlocked
        // root. Status is read before parent: a union locks the child root
        // before reading its worker set and moves the parent before
        // unlocking, so it either carries the bit over or is seen here.
        let mut backoff = Backoff::new();
        loop {
            let node = self.node(f);
            let status = node.uf_status.load(Ordering::SeqCst);
            let p = node.parent.load(Ordering::SeqCst);
            if p == f {
                match status {
                    uf_status::DEAD => return Claim::Dead,
                    uf_status::LOCKED => {
                        backoff.snooze();
                        continue;
                    }
                    _ => break,
                }
            }
            f = p;
            self.node(f).w_set.fetch_or(mask, Ordering::SeqCst);
        }
        Claim::Success
    }

    /// Whether `r` was ever claimed.
    #[must_use]
    pub fn is_claimed(&self, r: StateRef) -> bool {
        self.status(r.get()) != uf_status::UNSEEN
    }

    // -----------------------------------------------------------------------
    // Find / same_set / union
    // -----------------------------------------------------------------------

    /// Root of the set containing `r`, splitting the path on the way.
    ///
    /// Each step moves one node from its parent to its grandparent, and only
    /// if the parent is unchanged. The new parent is always an ancestor of
    /// the node, so a root is never written and no cycle can form, whatever
    /// unions run concurrently.
    #[must_use]
    pub fn find(&self, r: StateRef) -> StateRef {
        let mut x = r.get();
        loop {
            let p = self.parent(x);
            if p == x {
                return StateRef::new(x);
            }
            let grandparent = self.parent(p);
            if grandparent != p {
                // A lost race means another find already moved `x` up.
                self.node(x)
                    .parent
                    .compare_exchange(p, grandparent, Ordering::AcqRel, Ordering::Acquire)
                    .ok();
            }
            x = p;
        }
    }

    /// Whether `a` and `b` are in the same set.
    ///
    /// A `false` answer is only returned for two roots observed stable and
    /// unlocked.
    #[must_use]
    pub fn same_set(&self, a: StateRef, b: StateRef) -> bool {
        let (mut a, mut b) = (a, b);
        let mut backoff = Backoff::new();
        loop {
            let af = self.find(a);
            let bf = self.find(b);
            if af == bf {
                return true;
            }
            let (x, y) = (af.get(), bf.get());
            if self.parent(x) == x
                && self.parent(y) == y
                && self.status(x) != uf_status::LOCKED
                && self.status(y) != uf_status::LOCKED
            {
                return false;
            }
            a = af;
            b = bf;
            backoff.snooze();
        }
    }

    /// Unite the sets of `a` and `b`. Returns whether the united set
    /// contains an accepting state.
    ///
    /// # Panics
    ///
    /// Panics if either set is dead.
    pub fn union(&self, a: StateRef, b: StateRef) -> bool {
        let Some((x, y)) = self.lock_roots(a, b) else {
            return self.is_accepting(a);
        };

        self.merge_lists(x, y);

        let (root, child) = {
            let rx = self.node(x).rank.load(Ordering::Acquire);
            let ry = self.node(y).rank.load(Ordering::Acquire);
            if rx > ry {
                (x, y)
            } else {
                if rx == ry {
                    self.node(y).rank.store(ry.saturating_add(1), Ordering::Release);
                }
                (y, x)
            }
        };

        let root_node = self.node(root);
        let child_node = self.node(child);
        root_node
            .w_set
            .fetch_or(child_node.w_set.load(Ordering::SeqCst), Ordering::SeqCst);
        let child_accepting = child_node.accepting.load(Ordering::Acquire);
        let accepting = root_node
            .accepting
            .fetch_or(child_accepting, Ordering::AcqRel)
            || child_accepting;
        child_node.parent.store(root, Ordering::SeqCst);

        self.unlock_root(x);
        self.unlock_root(y);
        accepting
    }

    /// Whether the set of `r` contains an accepting state.
    #[must_use]
    pub fn is_accepting(&self, r: StateRef) -> bool {
        self.node(self.find(r).get())
            .accepting
            .load(Ordering::Acquire)
    }

    /// Worker set recorded on the root of `r`.
    #[must_use]
    pub fn workers(&self, r: StateRef) -> u64 {
        self.node(self.find(r).get())
            .w_set
            .load(Ordering::Acquire)
    }

    /// Lock the roots of `a` and `b`, lowest first. `None` if they share a
    /// root.
    fn lock_roots(&self, a: StateRef, b: StateRef) -> Option<(u32, u32)> {
        let mut backoff = Backoff::new();
        loop {
            let x = self.find(a).get();
            let y = self.find(b).get();
            if x == y {
                return None;
            }
            for root in [x, y] {
                assert_ne!(
                    self.status(root),
                    uf_status::DEAD,
                    "union on dead component root #{root}"
                );
            }
            let (first, second) = if x < y { (x, y) } else { (y, x) };
            if self.try_lock_root(first) {
                if self.try_lock_root(second) {
                    return Some((x, y));
                }
                self.unlock_root(first);
            }
            backoff.snooze();
        }
    }

    fn try_lock_root(&self, x: u32) -> bool {
        let node = self.node(x);
        if node
            .uf_status
            .compare_exchange(
                uf_status::LIVE,
                uf_status::LOCKED,
                Ordering::SeqCst,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        if self.parent(x) == x {
            return true;
        }
        self.unlock_root(x);
        false
    }

    fn unlock_root(&self, x: u32) {
        self.node(x)
            .uf_status
            .store(uf_status::LIVE, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------------
    // Still-explorable lists
    // -----------------------------------------------------------------------

    /// Whether `r` still has successors to explore.
    #[must_use]
    pub fn is_in_list(&self, r: StateRef) -> bool {
        self.list_status(r.get()) != list_status::TOMBSTONE
    }

    /// Turn `r` into a tombstone of its component list. Idempotent; waits
    /// while a merge holds the node.
    pub fn remove_from_list(&self, r: StateRef) {
        let node = self.node(r.get());
        let mut backoff = Backoff::new();
        loop {
            match node.list_status.compare_exchange(
                list_status::LIVE,
                list_status::TOMBSTONE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) | Err(list_status::TOMBSTONE) => return,
                Err(_) => backoff.snooze(),
            }
        }
    }

    /// Find a live member of the component of the tombstone `r`. Marks the
    /// component dead when none is left.
    pub fn pick_from_list(&self, r: StateRef) -> Pick {
        match self.next_live(r.get()) {
            Some(live) => Pick::Live(StateRef::new(live)),
            None if self.mark_dead(r) => Pick::MarkedDead,
            None => Pick::Dead,
        }
    }

    /// Walk the cyclic list from `start`, unlinking runs of tombstones on
    /// the way. `None` when every member is a tombstone.
    fn next_live(&self, start: u32) -> Option<u32> {
        if self.list_status(start) != list_status::TOMBSTONE {
            return Some(start);
        }
        let mut s = start;
        let mut n1 = self.list_next(s);
        while self.list_status(s) == list_status::TOMBSTONE {
            if s == n1 {
                return None;
            }
            if self.list_status(n1) == list_status::TOMBSTONE {
                let n2 = self.list_next(n1);
                if s == n2 {
                    return None;
                }
                self.node(s).list_next.store(n2, Ordering::Release);
                s = n2;
                n1 = self.list_next(s);
            } else {
                s = n1;
                break;
            }
        }
        self.node(start).list_next.store(s, Ordering::Release);
        Some(s)
    }

    /// Move a live member of the list through `x` to `BUSY`.
    fn lock_list_node(&self, x: u32) -> u32 {
        let mut at = x;
        let mut backoff = Backoff::new();
        loop {
            match self.list_status(at) {
                list_status::TOMBSTONE => {
                    let Some(live) = self.next_live(at) else {
                        panic!("locked component of #{x} has no live list member");
                    };
                    at = live;
                }
                list_status::LIVE => {
                    if self
                        .node(at)
                        .list_status
                        .compare_exchange(
                            list_status::LIVE,
                            list_status::BUSY,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return at;
                    }
                }
                _ => backoff.snooze(),
            }
        }
    }

    /// Splice the lists of the locked roots `x` and `y` into one cycle.
    fn merge_lists(&self, x: u32, y: u32) {
        let a = self.lock_list_node(x);
        let b = self.lock_list_node(y);
        let a_next = self.list_next(a);
        let b_next = self.list_next(b);
        self.node(a).list_next.store(b_next, Ordering::Release);
        self.node(b).list_next.store(a_next, Ordering::Release);
        self.node(a)
            .list_status
            .store(list_status::LIVE, Ordering::Release);
        self.node(b)
            .list_status
            .store(list_status::LIVE, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Dead components
    // -----------------------------------------------------------------------

    /// Whether the component of `r` is complete.
    #[must_use]
    pub fn is_dead(&self, r: StateRef) -> bool {
        self.status(self.find(r).get()) == uf_status::DEAD
    }

    /// Mark the component of `r` dead. Returns whether this call did it.
    pub fn mark_dead(&self, r: StateRef) -> bool {
        let mut marked = false;
        let mut backoff = Backoff::new();
        let mut f = self.find(r);
        while !self.is_dead(f) {
            f = self.find(f);
            if self
                .node(f.get())
                .uf_status
                .compare_exchange(
                    uf_status::LIVE,
                    uf_status::DEAD,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                marked = true;
            } else {
                backoff.snooze();
            }
        }
        if marked {
            tracing::trace!(target: "mcscc.uf", root = %f, "component marked dead");
        }
        marked
    }
}

impl std::fmt::Debug for UnionFind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnionFind")
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}
