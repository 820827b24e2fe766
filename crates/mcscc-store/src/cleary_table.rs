//! Concurrent Cleary-style compact hash table issuing dense state references.
//!
//! A key of `log_size + 28` bits is split into a *home* slot (high bits) and
//! a 28-bit *remainder* (low bits). Only the remainder is stored; the home is
//! recovered from the slot's position relative to the `virgin` and `change`
//! flags of its cluster:
//!
//! - `virgin` is positional: slot `h` has it set iff some stored key has home
//!   `h`. It never moves when entries shift.
//! - `change` marks the first entry of each home group inside a cluster.
//!   Groups appear in home order, entries inside a group in remainder order.
//!
//! Occupied slots are never vacated. A key is inserted either by a single
//! CAS on an empty home slot (fast path) or by locking the two empty slots
//! bounding its cluster and shifting entries toward the nearer one.
//!
//! Each slot word also carries the [`StateRef`] of its entry, which moves
//! with the entry. References are issued from one counter after the
//! insertion point is secured, so they stay dense.
//!
//! Table capacity is fixed; `TableFull` is reported to the caller and never
//! retried here.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use mcscc_error::{McscError, Result};
use mcscc_types::StateRef;
use tracing::{debug, warn};

use crate::backoff::Backoff;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Remainder bits stored per slot.
pub const REMAINDER_BITS: u32 = 28;

/// Smallest accepted `log_size`; leaves room for the breathing space.
pub const MIN_LOG_SIZE: u32 = 8;

/// Largest accepted `log_size`; references must fit in 32 bits.
pub const MAX_LOG_SIZE: u32 = 30;

/// Upper bound on the cluster-width threshold.
const MAX_CLUSTER_THRESHOLD: u64 = 1 << 20;

const REST_MASK: u64 = (1 << REMAINDER_BITS) - 1;
const OCCUPIED: u64 = 1 << 28;
const LOCKED: u64 = 1 << 29;
const VIRGIN: u64 = 1 << 30;
const CHANGE: u64 = 1 << 31;
const REF_SHIFT: u32 = 32;
const LOW_MASK: u64 = (1 << REF_SHIFT) - 1;

// ---------------------------------------------------------------------------
// Slot word helpers
// ---------------------------------------------------------------------------

#[inline]
const fn rest(w: u64) -> u64 {
    w & REST_MASK
}

#[inline]
const fn occupied(w: u64) -> bool {
    w & OCCUPIED != 0
}

#[inline]
const fn locked(w: u64) -> bool {
    w & LOCKED != 0
}

#[inline]
const fn virgin(w: u64) -> bool {
    w & VIRGIN != 0
}

#[inline]
const fn change(w: u64) -> i64 {
    ((w & CHANGE) >> 31) as i64
}

#[inline]
const fn slot_ref(w: u64) -> StateRef {
    StateRef::new((w >> REF_SHIFT) as u32)
}

#[inline]
const fn with_flag(w: u64, flag: u64, on: bool) -> u64 {
    if on { w | flag } else { w & !flag }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of [`ClearyTable::find_or_put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindOrPut {
    /// The key was already present with this reference.
    Found(StateRef),
    /// The key was absent and has been inserted with a fresh reference.
    Inserted(StateRef),
    /// The key is absent and insertion was not requested.
    NotFound,
}

impl FindOrPut {
    /// Reference of a found or inserted key.
    #[must_use]
    pub const fn state_ref(self) -> Option<StateRef> {
        match self {
            Self::Found(r) | Self::Inserted(r) => Some(r),
            Self::NotFound => None,
        }
    }

    /// Whether this call created the entry.
    #[must_use]
    pub const fn is_inserted(self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Result of one locked attempt.
enum Attempt {
    Done(FindOrPut),
    Retry,
}

// ---------------------------------------------------------------------------
// ClearyTable
// ---------------------------------------------------------------------------

/// Fixed-capacity concurrent Cleary table.
pub struct ClearyTable {
    slots: Box<[AtomicU64]>,
    log_size: u32,
    key_mask: u64,
    b_space: u64,
    threshold: u64,
    next_ref: AtomicU32,
}

impl ClearyTable {
    /// Create a table of `2^log_size` home slots with the default cluster
    /// threshold (`size / 64`, at most 2^20).
    ///
    /// # Errors
    ///
    /// Returns [`McscError::InvalidConfig`] if `log_size` is outside
    /// `MIN_LOG_SIZE..=MAX_LOG_SIZE`.
    pub fn new(log_size: u32) -> Result<Self> {
        let threshold = ((1_u64 << log_size.min(MAX_LOG_SIZE)) / 64).min(MAX_CLUSTER_THRESHOLD);
        Self::with_threshold(log_size, threshold)
    }

    /// Create a table with an explicit cluster-width threshold.
    ///
    /// # Errors
    ///
    /// Returns [`McscError::InvalidConfig`] if `log_size` is out of range or
    /// `threshold` is smaller than 2.
    pub fn with_threshold(log_size: u32, threshold: u64) -> Result<Self> {
        if !(MIN_LOG_SIZE..=MAX_LOG_SIZE).contains(&log_size) {
            return Err(McscError::invalid_config(format!(
                "log_table_size {log_size} outside {MIN_LOG_SIZE}..={MAX_LOG_SIZE}"
            )));
        }
        if threshold < 2 {
            return Err(McscError::invalid_config(format!(
                "cluster threshold {threshold} must be at least 2"
            )));
        }
        let size = 1_u64 << log_size;
        let b_space = size >> 5;
        let total = size + 2 * b_space;
        let slots: Box<[AtomicU64]> = (0..total).map(|_| AtomicU64::new(0)).collect();
        debug!(
            target: "mcscc.table",
            log_size,
            slots = total,
            threshold,
            "cleary table created"
        );
        Ok(Self {
            slots,
            log_size,
            key_mask: (1_u64 << (log_size + REMAINDER_BITS)) - 1,
            b_space,
            threshold,
            next_ref: AtomicU32::new(0),
        })
    }

    /// Number of home slots (`2^log_size`).
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        1 << self.log_size
    }

    /// Log2 of the home slot count.
    #[must_use]
    pub const fn log_size(&self) -> u32 {
        self.log_size
    }

    /// Bits of a key that take part in indexing.
    #[must_use]
    pub const fn key_mask(&self) -> u64 {
        self.key_mask
    }

    /// Number of references issued so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.next_ref.load(Ordering::Acquire) as usize
    }

    /// Whether no key has been inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of occupied slots. Scans the whole table.
    #[must_use]
    pub fn occupied_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| occupied(s.load(Ordering::Acquire)))
            .count()
    }

    /// Bytes held by the slot array.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.slots.len() * std::mem::size_of::<AtomicU64>()
    }

    /// Look up `key`, inserting it when absent and `insert` is true.
    ///
    /// Only the low `log_size + 28` bits of `key` are used.
    ///
    /// # Errors
    ///
    /// Returns [`McscError::TableFull`] when the key's cluster reaches the
    /// threshold or the table edge.
    pub fn find_or_put(&self, key: u64, insert: bool) -> Result<FindOrPut> {
        self.find_or_put_with(key, insert, |_| {})
    }

    /// Like [`find_or_put`](Self::find_or_put), running `init` with the new
    /// reference before the entry becomes visible to other callers.
    ///
    /// `init` runs at most once and only when this call inserts.
    ///
    /// # Errors
    ///
    /// See [`find_or_put`](Self::find_or_put).
    pub fn find_or_put_with(
        &self,
        key: u64,
        insert: bool,
        init: impl FnOnce(StateRef),
    ) -> Result<FindOrPut> {
        let key = key & self.key_mask;
        let rem = key & REST_MASK;
        let idx = (key >> REMAINDER_BITS) + self.b_space;
        let mut init = Some(init);
        let mut backoff = Backoff::new();

        loop {
            let check = self.load(idx);
            if !occupied(check) {
                if !insert {
                    return Ok(FindOrPut::NotFound);
                }
                let expected = check & !(OCCUPIED | LOCKED);
                let claimed = rem | OCCUPIED | CHANGE | VIRGIN | LOCKED;
                match self.slots[idx as usize].compare_exchange(
                    expected,
                    claimed,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let r = self.issue_ref(&mut init);
                        let word = (claimed & !LOCKED) | (u64::from(r.get()) << REF_SHIFT);
                        self.slots[idx as usize].store(word, Ordering::Release);
                        return Ok(FindOrPut::Inserted(r));
                    }
                    Err(seen) if !occupied(seen) => {
                        backoff.snooze();
                        continue;
                    }
                    Err(_) => {}
                }
            }

            let left = self.find_left_from(idx)?;
            let right = self.find_right_from(idx)?;
            if right - left >= self.threshold {
                return Err(self.full(right - left));
            }

            if !self.try_lock(left) {
                backoff.snooze();
                continue;
            }
            if !self.try_lock(right) {
                self.unlock(left);
                backoff.snooze();
                continue;
            }
            let guard = BoundaryGuard {
                table: self,
                left,
                right,
            };
            match self.locked_find_or_put(&guard, idx, rem, insert, &mut init) {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Retry => {
                    drop(guard);
                    backoff.snooze();
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cluster critical section
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn locked_find_or_put<F: FnOnce(StateRef)>(
        &self,
        guard: &BoundaryGuard<'_>,
        idx: u64,
        rem: u64,
        insert: bool,
        init: &mut Option<F>,
    ) -> Attempt {
        let (left, right) = (guard.left, guard.right);
        // A fast-path insert still publishing its reference, or a previous
        // holder still clearing its lock bit.
        if (left + 1..right).any(|p| locked(self.load(p))) {
            return Attempt::Retry;
        }

        let home_virgin = virgin(self.load(idx));
        let mut count: i64 = 0;
        let mut j = idx;

        // Shift toward the nearer empty boundary.
        if idx - left > right - idx {
            while j < right {
                count -= i64::from(virgin(self.load(j)));
                j += 1;
            }

            if home_virgin {
                let mut c2 = count;
                j -= 1;
                loop {
                    let w = self.load(j);
                    if c2 >= 1 || !occupied(w) {
                        break;
                    }
                    c2 += change(w);
                    if c2 == 0 {
                        if rest(w) < rem {
                            break;
                        }
                        if rest(w) == rem {
                            return Attempt::Done(FindOrPut::Found(slot_ref(w)));
                        }
                    }
                    j -= 1;
                }
            }

            if !insert {
                return Attempt::Done(FindOrPut::NotFound);
            }

            let mut num_in_group = 0_u32;
            let mut q = right;
            loop {
                let prev = self.load(q - 1);
                count += change(prev);
                if (home_virgin && count == 0 && rest(prev) < rem)
                    || count == 1
                    || (count == 0 && !occupied(prev))
                {
                    break;
                }
                if count == 0 {
                    num_in_group += 1;
                }
                self.move_entry(q - 1, q);
                q -= 1;
            }

            let r = self.issue_ref(init);
            let mut word = self.entry_word(q, rem, r);
            if !home_virgin {
                self.set_flag(idx, VIRGIN, true);
                word = self.entry_word(q, rem, r) | CHANGE;
            } else if num_in_group == 0 {
                self.set_flag(q - 1, CHANGE, false);
                word |= CHANGE;
            }
            self.slots[q as usize].store(word, Ordering::Release);
            Attempt::Done(FindOrPut::Inserted(r))
        } else {
            while j > left {
                count -= i64::from(virgin(self.load(j)));
                j -= 1;
            }

            if home_virgin {
                let mut c2 = count;
                j += 1;
                loop {
                    let w = self.load(j);
                    if c2 >= 0 || !occupied(w) {
                        break;
                    }
                    if c2 == -1 {
                        if rest(w) > rem {
                            break;
                        }
                        if rest(w) == rem {
                            return Attempt::Done(FindOrPut::Found(slot_ref(w)));
                        }
                    }
                    c2 += change(w);
                    j += 1;
                }
            }

            if !insert {
                return Attempt::Done(FindOrPut::NotFound);
            }

            let mut q = left;
            loop {
                let next = self.load(q + 1);
                if (home_virgin && count == -1 && rest(next) > rem) || count == 0 {
                    break;
                }
                self.move_entry(q + 1, q);
                count += change(next);
                if home_virgin && count == 0 {
                    self.set_flag(q, CHANGE, false);
                }
                q += 1;
            }

            let r = self.issue_ref(init);
            let mut word = self.entry_word(q, rem, r);
            if count == 0 {
                self.set_flag(idx, VIRGIN, true);
                word = self.entry_word(q, rem, r) | CHANGE;
            }
            self.slots[q as usize].store(word, Ordering::Release);
            Attempt::Done(FindOrPut::Inserted(r))
        }
    }

    // -----------------------------------------------------------------------
    // Slot primitives
    // -----------------------------------------------------------------------

    #[inline]
    fn load(&self, pos: u64) -> u64 {
        self.slots[pos as usize].load(Ordering::Acquire)
    }

    /// Issue the next reference and run the caller's initializer.
    fn issue_ref<F: FnOnce(StateRef)>(&self, init: &mut Option<F>) -> StateRef {
        let r = StateRef::new(self.next_ref.fetch_add(1, Ordering::AcqRel));
        if let Some(f) = init.take() {
            f(r);
        }
        r
    }

    /// Word for a new entry at `pos`, keeping the positional bits of `pos`.
    fn entry_word(&self, pos: u64, rem: u64, r: StateRef) -> u64 {
        let positional = self.load(pos) & (VIRGIN | LOCKED);
        positional | rem | OCCUPIED | (u64::from(r.get()) << REF_SHIFT)
    }

    /// Copy the entry at `from` into `to`. Only the remainder, `change`,
    /// occupancy and reference move; `virgin` and `locked` stay put.
    fn move_entry(&self, from: u64, to: u64) {
        let src = self.load(from);
        let dst = self.load(to);
        let moved = (src & (REST_MASK | CHANGE | !LOW_MASK)) | OCCUPIED;
        let word = (dst & (VIRGIN | LOCKED)) | moved;
        self.slots[to as usize].store(word, Ordering::Release);
    }

    fn set_flag(&self, pos: u64, flag: u64, on: bool) {
        let w = self.load(pos);
        self.slots[pos as usize].store(with_flag(w, flag, on), Ordering::Release);
    }

    fn find_left_from(&self, mut pos: u64) -> Result<u64> {
        let start = pos;
        loop {
            if pos == 0 {
                return Err(self.full(start));
            }
            pos -= 1;
            if !occupied(self.load(pos)) {
                return Ok(pos);
            }
        }
    }

    fn find_right_from(&self, mut pos: u64) -> Result<u64> {
        let start = pos;
        let end = self.slots.len() as u64;
        loop {
            pos += 1;
            if pos >= end {
                return Err(self.full(pos - start));
            }
            if !occupied(self.load(pos)) {
                return Ok(pos);
            }
        }
    }

    /// Lock an empty boundary slot.
    fn try_lock(&self, pos: u64) -> bool {
        let current = self.load(pos);
        if locked(current) || occupied(current) {
            return false;
        }
        self.slots[pos as usize]
            .compare_exchange(current, current | LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn unlock(&self, pos: u64) {
        self.slots[pos as usize].fetch_and(!LOCKED, Ordering::Release);
    }

    fn full(&self, cluster_width: u64) -> McscError {
        warn!(
            target: "mcscc.table",
            capacity = self.capacity(),
            cluster_width,
            issued = self.len(),
            "cleary table full"
        );
        McscError::TableFull {
            capacity: self.capacity(),
            cluster_width,
        }
    }
}

impl std::fmt::Debug for ClearyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClearyTable")
            .field("log_size", &self.log_size)
            .field("threshold", &self.threshold)
            .field("issued", &self.len())
            .finish_non_exhaustive()
    }
}

/// Releases both cluster boundaries on every exit path.
struct BoundaryGuard<'a> {
    table: &'a ClearyTable,
    left: u64,
    right: u64,
}

impl Drop for BoundaryGuard<'_> {
    fn drop(&mut self) {
        self.table.unlock(self.left);
        self.table.unlock(self.right);
    }
}
