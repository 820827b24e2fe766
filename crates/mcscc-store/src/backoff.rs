//! Bounded backoff for CAS retry loops.
//!
//! Used by the indexing table when a boundary-slot lock is contended and by
//! the union-find lock loop. Each call to [`Backoff::snooze`] waits a little
//! longer, first by spinning and then by yielding to the OS scheduler; the
//! per-call delay is capped, the number of retries is not.

use std::hint;
use std::thread;

/// Spin rounds (as powers of two) before switching to `yield_now`.
const SPIN_LIMIT: u32 = 6;

/// Step after which the delay stops growing.
const YIELD_LIMIT: u32 = 10;

/// Exponential spin-then-yield backoff.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    /// Fresh backoff state.
    #[must_use]
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Wait before the next retry.
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1_u32 << self.step) {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        if self.step <= YIELD_LIMIT {
            self.step += 1;
        }
    }

    /// Whether the delay has reached its cap.
    #[must_use]
    pub const fn is_saturated(&self) -> bool {
        self.step > YIELD_LIMIT
    }

    /// Number of snoozes taken so far, capped at the saturation point.
    #[must_use]
    pub const fn step(&self) -> u32 {
        self.step
    }
}
