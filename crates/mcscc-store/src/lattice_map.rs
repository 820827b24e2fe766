//! Concurrent multimap from a key to a small set of `(value, status)` entries.
//!
//! Every key owns one head word. Entries beyond the first live in fixed-size
//! blocks handed out from per-worker arenas and chained through
//! reference-tagged words:
//!
//! ```text
//! head[k] ──Ref──▶ [ v | v | v | Ref ]──▶ [ v | tomb | v | End ]
//! ```
//!
//! The last word of a block is its *end*. When the end holds a value and
//! another value must be added, the inserting worker takes a fresh block
//! from its own arena, copies the end value into the block's first word and
//! installs a `Ref` to the block with one CAS. A `Ref` is never overwritten
//! afterwards. A losing worker rewinds its arena and rereads the word.
//!
//! Deletion turns a value into a tombstone; nothing is unlinked, so
//! concurrent traversals stay valid.
//!
//! Word layout (`u64`):
//!
//! | bits   | field                  |
//! |--------|------------------------|
//! | 0      | lock (head words only) |
//! | 1..4   | internal tag           |
//! | 4..7   | status                 |
//! | 7..64  | value / location       |

use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use mcscc_error::{McscError, Result};
use mcscc_types::MAX_WORKERS;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::cache_aligned::CacheAligned;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Bits available for an entry value.
pub const VALUE_BITS: u32 = 57;

/// Exclusive upper bound on entry values.
pub const MAX_VALUE: u64 = 1 << VALUE_BITS;

/// Exclusive upper bound on entry statuses.
pub const MAX_STATUS: u8 = 1 << 3;

/// Default words per block; one cache line.
pub const DEFAULT_BLOCK_SIZE: usize = 8;

/// Default arena words per key across all workers.
pub const DEFAULT_ARENA_FACTOR: usize = 32;

const LOCK_BIT: u64 = 1;
const TAG_SHIFT: u32 = 1;
const TAG_MASK: u64 = 0b111 << TAG_SHIFT;
const STATUS_SHIFT: u32 = 4;
const STATUS_MASK: u64 = 0b111 << STATUS_SHIFT;
const VALUE_SHIFT: u32 = 7;

/// Area index of the head table inside a [`Location`].
const HEAD_AREA: u64 = 0;
const AREA_SHIFT: u32 = 40;
const INDEX_MASK: u64 = (1 << AREA_SHIFT) - 1;

// ---------------------------------------------------------------------------
// Tags and words
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Empty,
    Ref,
    End,
    Value,
    ValueEnd,
    Tombstone,
    TombstoneEnd,
}

impl Tag {
    const fn bits(self) -> u64 {
        let raw = match self {
            Self::Empty => 0,
            Self::Ref => 1,
            Self::End => 2,
            Self::Value => 3,
            Self::ValueEnd => 4,
            Self::Tombstone => 5,
            Self::TombstoneEnd => 6,
        };
        raw << TAG_SHIFT
    }

    fn of(word: u64) -> Self {
        match (word & TAG_MASK) >> TAG_SHIFT {
            0 => Self::Empty,
            1 => Self::Ref,
            2 => Self::End,
            3 => Self::Value,
            4 => Self::ValueEnd,
            5 => Self::Tombstone,
            6 => Self::TombstoneEnd,
            other => panic!("corrupt lattice map tag {other}"),
        }
    }
}

#[inline]
const fn value_of(word: u64) -> u64 {
    word >> VALUE_SHIFT
}

#[inline]
const fn status_of(word: u64) -> u8 {
    ((word & STATUS_MASK) >> STATUS_SHIFT) as u8
}

/// Replace tag, status and value, keeping the lock bit.
#[inline]
const fn compose(old: u64, tag: Tag, status: u8, value: u64) -> u64 {
    (old & LOCK_BIT) | tag.bits() | ((status as u64) << STATUS_SHIFT) | (value << VALUE_SHIFT)
}

#[inline]
const fn retag(old: u64, tag: Tag) -> u64 {
    (old & !TAG_MASK) | tag.bits()
}

// ---------------------------------------------------------------------------
// Public value types
// ---------------------------------------------------------------------------

/// Address of one entry word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location(u64);

impl Location {
    const fn head(key: usize) -> Self {
        Self((HEAD_AREA << AREA_SHIFT) | key as u64)
    }

    const fn arena(worker: usize, index: usize) -> Self {
        Self((((worker as u64) + 1) << AREA_SHIFT) | index as u64)
    }

    const fn area(self) -> u64 {
        self.0 >> AREA_SHIFT
    }

    const fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether this is the head word of a key.
    #[must_use]
    pub const fn is_head(self) -> bool {
        self.area() == HEAD_AREA
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_head() {
            write!(f, "head[{}]", self.index())
        } else {
            write!(f, "arena{}[{}]", self.area() - 1, self.index())
        }
    }
}

/// One live entry observed during iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub value: u64,
    pub status: u8,
    pub location: Location,
}

/// Lattice map dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatticeMapConfig {
    /// Number of keys (head words).
    pub keys: usize,
    /// Number of arenas; at most this many handles can be registered.
    pub workers: usize,
    /// Words per block, at least 2.
    pub block_size: usize,
    /// Arena words per key, summed over all workers.
    pub arena_factor: usize,
}

impl Default for LatticeMapConfig {
    fn default() -> Self {
        Self {
            keys: 1 << 16,
            workers: 1,
            block_size: DEFAULT_BLOCK_SIZE,
            arena_factor: DEFAULT_ARENA_FACTOR,
        }
    }
}

impl LatticeMapConfig {
    /// Config for `keys` keys and `workers` arenas with default block sizing.
    #[must_use]
    pub fn new(keys: usize, workers: usize) -> Self {
        Self {
            keys,
            workers,
            ..Self::default()
        }
    }

    /// Override the block size.
    #[must_use]
    pub const fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Override the arena factor.
    #[must_use]
    pub const fn with_arena_factor(mut self, arena_factor: usize) -> Self {
        self.arena_factor = arena_factor;
        self
    }

    /// Words in each worker arena, a whole number of blocks.
    #[must_use]
    pub const fn arena_words(&self) -> usize {
        let total = self.keys * self.arena_factor;
        total / (self.block_size * self.workers) * self.block_size
    }

    /// Check dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`McscError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.keys == 0 || self.keys as u64 > INDEX_MASK {
            return Err(McscError::invalid_config(format!(
                "lattice map keys {} out of range",
                self.keys
            )));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(McscError::invalid_config(format!(
                "lattice map workers {} outside 1..={MAX_WORKERS}",
                self.workers
            )));
        }
        if self.block_size < 2 || self.block_size >= self.keys * self.arena_factor {
            return Err(McscError::invalid_config(format!(
                "lattice map block size {} outside 2..{}",
                self.block_size,
                self.keys * self.arena_factor
            )));
        }
        if self.arena_words() == 0 {
            return Err(McscError::invalid_config(
                "lattice map arenas hold no whole block",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Block pool private to one registered handle.
#[derive(Debug)]
struct Arena {
    words: Box<[AtomicU64]>,
    /// Next free word; only the owning handle moves it.
    next: AtomicUsize,
    claimed: AtomicBool,
}

impl Arena {
    fn new(words: usize) -> Self {
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            next: AtomicUsize::new(0),
            claimed: AtomicBool::new(false),
        }
    }
}

// ---------------------------------------------------------------------------
// LatticeMap
// ---------------------------------------------------------------------------

/// Concurrent key-to-entry-set map.
pub struct LatticeMap {
    heads: Box<[AtomicU64]>,
    arenas: Box<[CacheAligned<Arena>]>,
    block_size: usize,
}

impl LatticeMap {
    /// Create a map.
    ///
    /// # Errors
    ///
    /// Returns [`McscError::InvalidConfig`] for bad dimensions.
    pub fn new(config: &LatticeMapConfig) -> Result<Self> {
        config.validate()?;
        let arena_words = config.arena_words();
        debug!(
            target: "mcscc.lmap",
            keys = config.keys,
            workers = config.workers,
            block_size = config.block_size,
            arena_words,
            "lattice map created"
        );
        Ok(Self {
            heads: (0..config.keys).map(|_| AtomicU64::new(0)).collect(),
            arenas: (0..config.workers)
                .map(|_| CacheAligned::new(Arena::new(arena_words)))
                .collect(),
            block_size: config.block_size,
        })
    }

    /// Number of keys.
    #[must_use]
    pub fn keys(&self) -> usize {
        self.heads.len()
    }

    /// Claim a free arena for inserting.
    ///
    /// # Errors
    ///
    /// Returns [`McscError::NoFreeArena`] if every arena is held.
    pub fn register(&self) -> Result<LatticeMapHandle<'_>> {
        for (worker, arena) in self.arenas.iter().enumerate() {
            if arena
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(LatticeMapHandle { map: self, worker });
            }
        }
        Err(McscError::NoFreeArena {
            arenas: self.arenas.len(),
        })
    }

    /// Arena words handed out so far, over all workers.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.arenas
            .iter()
            .map(|a| a.next.load(Ordering::Relaxed))
            .sum()
    }

    /// Bytes held by head words and arenas.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        let words = self.heads.len() + self.arenas.iter().map(|a| a.words.len()).sum::<usize>();
        words * std::mem::size_of::<AtomicU64>()
    }

    // -----------------------------------------------------------------------
    // Point operations
    // -----------------------------------------------------------------------

    /// Value at `location`, or `None` if it was deleted.
    ///
    /// # Panics
    ///
    /// Panics if the location holds no entry.
    #[must_use]
    pub fn get(&self, location: Location) -> Option<u64> {
        let (location, word) = self.resolve(location);
        match Tag::of(word) {
            Tag::Value | Tag::ValueEnd => Some(value_of(word)),
            Tag::Tombstone | Tag::TombstoneEnd => None,
            tag => panic!("lattice map get on {tag:?} at {location}"),
        }
    }

    /// Status of the value at `location`.
    ///
    /// # Panics
    ///
    /// Panics if the location holds no live value.
    #[must_use]
    pub fn status(&self, location: Location) -> u8 {
        let (location, word) = self.resolve(location);
        match Tag::of(word) {
            Tag::Value | Tag::ValueEnd => status_of(word),
            tag => panic!("lattice map status on {tag:?} at {location}"),
        }
    }

    /// Overwrite the status of the value at `location`.
    ///
    /// # Panics
    ///
    /// Panics if the location holds no live value or `status` does not fit.
    pub fn set_status(&self, location: Location, status: u8) {
        assert!(status < MAX_STATUS, "status {status} exceeds 3 bits");
        self.update_value(location, "set_status", |w, _| {
            (w & !STATUS_MASK) | (u64::from(status) << STATUS_SHIFT)
        });
    }

    /// Replace `(old_value, old_status)` at `location` by
    /// `(value, status)`. Fails without retrying on any mismatch.
    #[must_use]
    pub fn cas_update(
        &self,
        location: Location,
        old_value: u64,
        old_status: u8,
        value: u64,
        status: u8,
    ) -> bool {
        assert!(value < MAX_VALUE, "value {value:#x} exceeds {VALUE_BITS} bits");
        assert!(status < MAX_STATUS, "status {status} exceeds 3 bits");
        let (location, word) = self.resolve(location);
        if value_of(word) != old_value || status_of(word) != old_status {
            return false;
        }
        let tag = Tag::of(word);
        if !matches!(tag, Tag::Value | Tag::ValueEnd) {
            return false;
        }
        self.cas(location, word, compose(word, tag, status, value))
    }

    /// Tombstone the value at `location`.
    ///
    /// # Panics
    ///
    /// Panics if the location holds no live value.
    pub fn delete(&self, location: Location) {
        self.update_value(location, "delete", |w, tag| {
            if tag == Tag::Value {
                retag(w, Tag::Tombstone)
            } else {
                retag(w, Tag::TombstoneEnd)
            }
        });
    }

    /// Tombstone the value at `location` if it still equals
    /// `(value, status)`. Returns whether this call deleted it.
    ///
    /// A value deleted and reinserted at the same location is
    /// indistinguishable here; callers must not reinsert a value they
    /// might still cas-delete.
    pub fn cas_delete(&self, location: Location, value: u64, status: u8) -> bool {
        let (location, word) = self.resolve(location);
        if value_of(word) != value || status_of(word) != status {
            return false;
        }
        let tombstone = match Tag::of(word) {
            Tag::Value => retag(word, Tag::Tombstone),
            Tag::ValueEnd => retag(word, Tag::TombstoneEnd),
            _ => return false,
        };
        self.cas(location, word, tombstone)
    }

    // -----------------------------------------------------------------------
    // Iteration
    // -----------------------------------------------------------------------

    /// Visit every live entry of `key` until `visit` breaks. Returns the
    /// location where the walk stopped, usable with
    /// [`iterate_from`](Self::iterate_from) and
    /// [`LatticeMapHandle::insert_from`].
    pub fn iterate(&self, key: usize, visit: impl FnMut(Entry) -> ControlFlow<()>) -> Location {
        self.iterate_from(Location::head(key), visit)
    }

    /// Resume iteration at `start`.
    pub fn iterate_from(
        &self,
        start: Location,
        mut visit: impl FnMut(Entry) -> ControlFlow<()>,
    ) -> Location {
        let mut location = start;
        loop {
            let word = self.load(location);
            match Tag::of(word) {
                Tag::Empty | Tag::End | Tag::TombstoneEnd => return location,
                Tag::Tombstone => location = location.next(),
                Tag::Ref => location = ref_target(word),
                Tag::Value => {
                    let entry = entry_at(word, location);
                    if visit(entry).is_break() {
                        return location;
                    }
                    location = location.next();
                }
                Tag::ValueEnd => match visit(entry_at(word, location)) {
                    // Last entry of the chain: break or not, the walk ends here.
                    ControlFlow::Break(()) | ControlFlow::Continue(()) => return location,
                },
            }
        }
    }

    /// Collect the live entries of `key`.
    #[must_use]
    pub fn entries(&self, key: usize) -> Vec<Entry> {
        let mut out = Vec::new();
        self.iterate(key, |e| {
            out.push(e);
            ControlFlow::Continue(())
        });
        out
    }

    // -----------------------------------------------------------------------
    // Per-key lock
    // -----------------------------------------------------------------------

    /// Try to take the lock bit of `key`'s head word.
    pub fn try_lock(&self, key: usize) -> bool {
        let head = &self.heads[key];
        let word = head.load(Ordering::Acquire);
        word & LOCK_BIT == 0
            && head
                .compare_exchange(word, word | LOCK_BIT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Spin until the lock bit of `key` is taken.
    pub fn lock(&self, key: usize) {
        let mut backoff = Backoff::new();
        while !self.try_lock(key) {
            backoff.snooze();
        }
    }

    /// Release the lock bit of `key`.
    pub fn unlock(&self, key: usize) {
        self.heads[key].fetch_and(!LOCK_BIT, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn cell(&self, location: Location) -> &AtomicU64 {
        if location.is_head() {
            &self.heads[location.index()]
        } else {
            &self.arenas[(location.area() - 1) as usize].words[location.index()]
        }
    }

    #[inline]
    fn load(&self, location: Location) -> u64 {
        self.cell(location).load(Ordering::Acquire)
    }

    #[inline]
    fn cas(&self, location: Location, current: u64, new: u64) -> bool {
        self.cell(location)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Current word for `location`. A value moved off a block end sits at
    /// the start of the linked block, which is never itself a link.
    fn resolve(&self, location: Location) -> (Location, u64) {
        let word = self.load(location);
        if Tag::of(word) == Tag::Ref {
            let target = ref_target(word);
            (target, self.load(target))
        } else {
            (location, word)
        }
    }

    /// Apply `f` to the live value at `location`, following a link
    /// installed concurrently.
    ///
    /// # Panics
    ///
    /// Panics if the location holds no live value.
    fn update_value(&self, mut location: Location, op: &str, f: impl Fn(u64, Tag) -> u64) {
        loop {
            let result = self
                .cell(location)
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                    let tag = Tag::of(w);
                    matches!(tag, Tag::Value | Tag::ValueEnd).then(|| f(w, tag))
                });
            match result {
                Ok(_) => return,
                Err(word) if Tag::of(word) == Tag::Ref => location = ref_target(word),
                Err(word) => panic!("lattice map {op} on {:?} at {location}", Tag::of(word)),
            }
        }
    }
}

impl fmt::Debug for LatticeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatticeMap")
            .field("keys", &self.heads.len())
            .field("workers", &self.arenas.len())
            .field("block_size", &self.block_size)
            .field("allocated", &self.allocated())
            .finish()
    }
}

#[inline]
const fn ref_target(word: u64) -> Location {
    Location(value_of(word))
}

#[inline]
fn entry_at(word: u64, location: Location) -> Entry {
    Entry {
        value: value_of(word),
        status: status_of(word),
        location,
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Inserting access to a [`LatticeMap`] through one private arena.
///
/// Dropping the handle releases the arena; blocks it linked stay in place.
pub struct LatticeMapHandle<'a> {
    map: &'a LatticeMap,
    worker: usize,
}

impl LatticeMapHandle<'_> {
    /// Arena index owned by this handle.
    #[must_use]
    pub const fn worker(&self) -> usize {
        self.worker
    }

    /// Add `(value, status)` to `key`'s set. Returns the entry's location.
    ///
    /// # Errors
    ///
    /// Returns [`McscError::BlockPoolExhausted`] if a new block is needed
    /// and this handle's arena is full.
    ///
    /// # Panics
    ///
    /// Panics if `value` or `status` does not fit its field.
    pub fn insert(&self, key: usize, value: u64, status: u8) -> Result<Location> {
        self.insert_from(Location::head(key), value, status)
    }

    /// Like [`insert`](Self::insert), starting the walk at `start` (a
    /// location previously returned by iteration of the same key).
    ///
    /// # Errors
    ///
    /// See [`insert`](Self::insert).
    pub fn insert_from(&self, start: Location, value: u64, status: u8) -> Result<Location> {
        assert!(value < MAX_VALUE, "value {value:#x} exceeds {VALUE_BITS} bits");
        assert!(status < MAX_STATUS, "status {status} exceeds 3 bits");
        let map = self.map;
        let mut location = start;
        let mut word = map.load(location);
        if location.is_head() && Tag::of(word) == Tag::Empty {
            // A head word is a block of one. A lost CAS means another insert
            // already wrote the head; the reload below sees either outcome.
            map.cas(location, word, retag(word, Tag::End));
            word = map.load(location);
        }
        loop {
            match Tag::of(word) {
                Tag::Empty | Tag::Tombstone => {
                    if map.cas(location, word, compose(word, Tag::Value, status, value)) {
                        return Ok(location);
                    }
                }
                Tag::End | Tag::TombstoneEnd => {
                    if map.cas(location, word, compose(word, Tag::ValueEnd, status, value)) {
                        return Ok(location);
                    }
                }
                Tag::Ref => location = ref_target(word),
                Tag::Value => location = location.next(),
                Tag::ValueEnd => {
                    let block = self.allocate_block()?;
                    map.cell(block).store(
                        compose(0, Tag::Value, status_of(word), value_of(word)),
                        Ordering::Release,
                    );
                    if map.cas(location, word, compose(word, Tag::Ref, 0, block.0)) {
                        location = block;
                    } else {
                        self.deallocate_last_block();
                    }
                }
            }
            word = map.load(location);
        }
    }

    fn arena(&self) -> &Arena {
        &self.map.arenas[self.worker]
    }

    /// Take the next block; its last word is marked as the block end.
    fn allocate_block(&self) -> Result<Location> {
        let arena = self.arena();
        let start = arena.next.load(Ordering::Relaxed);
        let end = start + self.map.block_size;
        if end > arena.words.len() {
            warn!(
                target: "mcscc.lmap",
                worker = self.worker,
                capacity = arena.words.len(),
                "lattice map arena exhausted"
            );
            return Err(McscError::BlockPoolExhausted {
                worker: self.worker,
                capacity: arena.words.len(),
            });
        }
        arena.next.store(end, Ordering::Relaxed);
        let end_word = &arena.words[end - 1];
        debug_assert_eq!(Tag::of(end_word.load(Ordering::Relaxed)), Tag::Empty);
        end_word.store(Tag::End.bits(), Ordering::Release);
        Ok(Location::arena(self.worker, start))
    }

    /// Return the most recent, never published, block to the arena.
    fn deallocate_last_block(&self) {
        let arena = self.arena();
        let start = arena.next.load(Ordering::Relaxed) - self.map.block_size;
        for word in &arena.words[start..start + self.map.block_size] {
            word.store(0, Ordering::Relaxed);
        }
        arena.next.store(start, Ordering::Relaxed);
    }
}

impl Drop for LatticeMapHandle<'_> {
    fn drop(&mut self) {
        self.arena().claimed.store(false, Ordering::Release);
    }
}

impl fmt::Debug for LatticeMapHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatticeMapHandle")
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}
