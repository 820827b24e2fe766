//! Shared identifiers for the mcscc workspace.

use std::fmt;

/// Maximum number of workers; every union-find node records its visitors in
/// a 64-bit worker set.
pub const MAX_WORKERS: usize = 64;

/// Dense identity of one distinct state vector.
///
/// References are issued by the indexing table in increasing order starting
/// at 0 and are never reused for a different vector.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct StateRef(u32);

impl StateRef {
    /// Wrap a raw reference.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw u32 value.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The reference as an array index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<StateRef> for u32 {
    fn from(r: StateRef) -> Self {
        r.0
    }
}

/// Index of one worker thread, `0..MAX_WORKERS`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct WorkerId(u8);

impl WorkerId {
    /// Create a worker id.
    ///
    /// Returns `None` if `id >= MAX_WORKERS`.
    #[inline]
    pub const fn new(id: usize) -> Option<Self> {
        if id < MAX_WORKERS {
            Some(Self(id as u8))
        } else {
            None
        }
    }

    /// The worker index.
    #[inline]
    pub const fn get(self) -> usize {
        self.0 as usize
    }

    /// Single-bit mask of this worker inside a worker set.
    #[inline]
    pub const fn mask(self) -> u64 {
        1_u64 << self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Outcome of an accepting-cycle search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Verdict {
    /// A cycle through at least one accepting state is reachable.
    CycleFound,
    /// No reachable cycle passes through an accepting state.
    NoCycleFound,
}

impl Verdict {
    /// Whether an accepting cycle was proved.
    #[must_use]
    pub const fn is_cycle(self) -> bool {
        matches!(self, Self::CycleFound)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CycleFound => f.write_str("accepting cycle found"),
            Self::NoCycleFound => f.write_str("no accepting cycle"),
        }
    }
}
