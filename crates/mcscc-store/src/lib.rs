//! Shared state storage for the multi-core SCC checker.
//!
//! - [`FrameStack`]: per-worker two-array DFS stack.
//! - [`ClearyTable`]: lock-free-on-the-fast-path compact hash table that
//!   issues dense [`StateRef`](mcscc_types::StateRef)s.
//! - [`StateStore`]: state-vector interning over the Cleary table.
//! - [`LatticeMap`]: per-key sets of small `(value, status)` entries in
//!   per-worker block arenas.

pub mod backoff;
pub mod cache_aligned;
pub mod cleary_table;
pub mod frame_stack;
pub mod lattice_map;
pub mod state_store;

pub use backoff::Backoff;
pub use cache_aligned::{CACHE_LINE_BYTES, CacheAligned};
pub use cleary_table::{ClearyTable, FindOrPut, MAX_LOG_SIZE, MIN_LOG_SIZE, REMAINDER_BITS};
pub use frame_stack::FrameStack;
pub use lattice_map::{
    DEFAULT_ARENA_FACTOR, DEFAULT_BLOCK_SIZE, Entry, LatticeMap, LatticeMapConfig,
    LatticeMapHandle, Location, MAX_STATUS, MAX_VALUE, VALUE_BITS,
};
pub use state_store::{MAX_PROBES, StateStore};
