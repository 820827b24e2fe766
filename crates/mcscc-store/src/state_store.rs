//! Reference-to-state store layered over the [`ClearyTable`].
//!
//! The Cleary table only remembers keys. A state hash can collide with a
//! different state's hash on the bits the table keeps, so each state is
//! probed under a short sequence of salted keys: the first key that is
//! absent, or present and mapped to an equal state, decides its reference.
//! The state vector itself is kept in a slot array indexed by reference and
//! written before the reference is published.

use std::sync::OnceLock;

use mcscc_error::{McscError, Result};
use mcscc_types::StateRef;

use crate::cleary_table::{ClearyTable, FindOrPut};

/// Salted keys tried per state before giving up.
pub const MAX_PROBES: u32 = 8;

/// Finalizer of splitmix64; spreads the salted hash over all key bits.
#[inline]
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Table key for probe number `probe` of `hash`.
#[inline]
fn probe_key(hash: u64, probe: u32) -> u64 {
    mix(hash ^ u64::from(probe).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Concurrent state-vector interning.
pub struct StateStore<S> {
    table: ClearyTable,
    states: Box<[OnceLock<S>]>,
}

impl<S: Eq + Clone> StateStore<S> {
    /// Create a store over a table of `2^log_size` home slots.
    ///
    /// # Errors
    ///
    /// Propagates table configuration errors.
    pub fn new(log_size: u32) -> Result<Self> {
        Ok(Self::over(ClearyTable::new(log_size)?))
    }

    /// Wrap an existing, empty table.
    #[must_use]
    pub fn over(table: ClearyTable) -> Self {
        let slots = (table.capacity() + 2 * (table.capacity() >> 5)) as usize;
        let states = (0..slots).map(|_| OnceLock::new()).collect();
        Self { table, states }
    }

    /// Intern `state`, returning its reference and whether this call
    /// created it.
    ///
    /// # Errors
    ///
    /// Returns [`McscError::TableFull`] when the table has no room and
    /// [`McscError::KeyCollisions`] when every salted key is taken by a
    /// different state.
    pub fn find_or_put(&self, state: &S, hash: u64) -> Result<(StateRef, bool)> {
        for probe in 0..MAX_PROBES {
            let key = probe_key(hash, probe);
            let outcome = self.table.find_or_put_with(key, true, |r| {
                // Runs once per fresh reference, before any other worker can see it.
                let fresh = self.states[r.index()].set(state.clone()).is_ok();
                debug_assert!(fresh, "reference {r} initialized twice");
            })?;
            match outcome {
                FindOrPut::Inserted(r) => return Ok((r, true)),
                FindOrPut::Found(r) => {
                    if self.stored(r) == state {
                        return Ok((r, false));
                    }
                }
                FindOrPut::NotFound => unreachable!("insert requested"),
            }
        }
        Err(McscError::KeyCollisions {
            hash,
            probes: MAX_PROBES,
        })
    }

    /// Reference of `state` if it was interned.
    ///
    /// # Errors
    ///
    /// Returns [`McscError::TableFull`] if a probed cluster overflows.
    pub fn lookup(&self, state: &S, hash: u64) -> Result<Option<StateRef>> {
        for probe in 0..MAX_PROBES {
            match self.table.find_or_put(probe_key(hash, probe), false)? {
                FindOrPut::Found(r) if self.stored(r) == state => return Ok(Some(r)),
                FindOrPut::Found(_) => {}
                FindOrPut::NotFound | FindOrPut::Inserted(_) => return Ok(None),
            }
        }
        Ok(None)
    }

    /// State vector interned under `r`.
    #[must_use]
    pub fn get(&self, r: StateRef) -> Option<&S> {
        self.states.get(r.index()).and_then(OnceLock::get)
    }

    /// Number of interned states.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether nothing was interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Upper bound on the references the table can issue.
    #[must_use]
    pub fn max_refs(&self) -> usize {
        self.states.len()
    }

    /// The underlying table.
    #[must_use]
    pub const fn table(&self) -> &ClearyTable {
        &self.table
    }

    /// Bytes held by the table and the slot array, excluding heap data
    /// owned by the states themselves.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.table.memory_bytes() + self.states.len() * std::mem::size_of::<OnceLock<S>>()
    }

    fn stored(&self, r: StateRef) -> &S {
        match self.get(r) {
            Some(s) => s,
            None => unreachable!("reference {r} published before its state"),
        }
    }
}

impl<S> std::fmt::Debug for StateStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}
