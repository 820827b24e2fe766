//! Padding for per-worker arena headers.
//!
//! The lattice map keeps one arena header per worker in a single boxed
//! slice. Each header holds the owner's allocation cursor, bumped on every
//! block the worker takes, so two neighbouring headers must not share a
//! cache line. [`CacheAligned`] aligns and pads to [`CACHE_LINE_BYTES`],
//! which is two 64-byte lines: the adjacent-line prefetcher on x86-64 and
//! the 128-byte lines of Apple AArch64 cores would otherwise still couple
//! neighbours.

/// Alignment and padding granule of [`CacheAligned`], in bytes.
pub const CACHE_LINE_BYTES: usize = 128;

/// A value that starts on, and fills whole, [`CACHE_LINE_BYTES`] granules.
#[repr(C, align(128))]
pub struct CacheAligned<T>(T);

impl<T> CacheAligned<T> {
    #[inline]
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CacheAligned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
