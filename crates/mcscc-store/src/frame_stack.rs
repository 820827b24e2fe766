//! Two-array frame stack for iterative depth-first search.
//!
//! All elements live in one flat vector; a second vector records the length
//! of every closed frame. [`FrameStack::enter`] closes the current frame and
//! opens an empty one, [`FrameStack::leave`] drops the current frame and
//! restores the previous one. Both are O(1) and allocate nothing beyond the
//! amortized growth of the two vectors.
//!
//! ```text
//! [root] [frame 1 ....] [frame 2 ....] ... [current frame ....]
//! ```
//!
//! Elements can also be consumed from the *bottom* of the current frame
//! ([`FrameStack::pop_bottom`]); those stay physically present until the
//! frame is observed empty.
//!
//! Single-writer; no internal synchronization.

use std::ops::ControlFlow;

/// Length bookkeeping of one closed frame.
#[derive(Debug, Clone, Copy)]
struct SavedFrame {
    size: usize,
    bottom: usize,
}

/// LIFO of elements grouped into nested frames.
#[derive(Debug, Clone)]
pub struct FrameStack<T> {
    states: Vec<T>,
    frames: Vec<SavedFrame>,
    /// Physical elements in the current frame.
    frame_size: usize,
    /// Elements consumed from the bottom of the current frame.
    frame_bottom: usize,
    peak_len: usize,
}

impl<T> Default for FrameStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameStack<T> {
    /// Empty stack with a single, empty, current frame.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            states: Vec::new(),
            frames: Vec::new(),
            frame_size: 0,
            frame_bottom: 0,
            peak_len: 0,
        }
    }

    /// Empty stack with room for `capacity` elements.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            states: Vec::with_capacity(capacity),
            ..Self::new()
        }
    }

    /// Push onto the current frame.
    #[inline]
    pub fn push(&mut self, state: T) {
        self.frame_size += 1;
        self.states.push(state);
        self.peak_len = self.peak_len.max(self.states.len());
    }

    /// Pop the top of the current frame.
    ///
    /// # Panics
    ///
    /// Panics if the current frame is empty.
    #[track_caller]
    pub fn pop(&mut self) -> T {
        assert!(self.frame_len() > 0, "pop on empty frame");
        self.frame_size -= 1;
        match self.states.pop() {
            Some(state) => state,
            None => unreachable!("frame sizes exceed stored elements"),
        }
    }

    /// Top of the current frame, or `None` if the frame is empty.
    ///
    /// Observing an empty frame discards elements consumed from its bottom.
    pub fn top(&mut self) -> Option<&T> {
        if self.frame_len() == 0 {
            self.clean_frame();
            return None;
        }
        self.states.last()
    }

    /// Close the current frame and open an empty one.
    ///
    /// # Panics
    ///
    /// Panics if the current frame is empty.
    #[track_caller]
    pub fn enter(&mut self) {
        assert!(
            self.frame_len() > 0,
            "enter on empty frame ({} == {})",
            self.frame_size,
            self.frame_bottom
        );
        self.frames.push(SavedFrame {
            size: self.frame_size,
            bottom: self.frame_bottom,
        });
        self.frame_size = 0;
        self.frame_bottom = 0;
    }

    /// Drop every element of the current frame and reopen the previous one.
    ///
    /// # Panics
    ///
    /// Panics if no frame was entered.
    #[track_caller]
    pub fn leave(&mut self) {
        let Some(saved) = self.frames.pop() else {
            panic!("leave on empty stack");
        };
        let keep = self.states.len() - self.frame_size;
        self.states.truncate(keep);
        self.frame_size = saved.size;
        self.frame_bottom = saved.bottom;
    }

    /// Element at the top of the frame `frame_offset` frames below the
    /// current one. `peek(0)` is the top of the current frame, `peek(1)` the
    /// element whose expansion opened it.
    ///
    /// # Panics
    ///
    /// Panics if the addressed element does not exist.
    #[track_caller]
    #[must_use]
    pub fn peek(&self, frame_offset: usize) -> &T {
        self.peek_at(frame_offset, 0)
    }

    /// Element `offset` positions below the top of the frame `frame_offset`
    /// frames back.
    ///
    /// # Panics
    ///
    /// Panics if `frame_offset == 0` and the current frame is empty, or if
    /// the addressed element does not exist.
    #[track_caller]
    #[must_use]
    pub fn peek_at(&self, frame_offset: usize, offset: usize) -> &T {
        assert!(
            frame_offset != 0 || self.frame_len() > 0,
            "peek top on empty frame"
        );
        let mut depth = if frame_offset > 0 { self.frame_size } else { 0 };
        for x in 1..frame_offset {
            depth += self.frames[self.frames.len() - x].size;
        }
        let depth = depth + offset;
        assert!(depth < self.states.len(), "peek past stack bottom");
        &self.states[self.states.len() - 1 - depth]
    }

    /// Number of closed frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Live elements in the current frame.
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        self.frame_size - self.frame_bottom
    }

    /// Elements physically on the stack, across all frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the stack holds no elements at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Most elements ever held at once.
    #[must_use]
    pub const fn peak_len(&self) -> usize {
        self.peak_len
    }

    /// Bytes currently reserved by both backing vectors.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.states.capacity() * std::mem::size_of::<T>()
            + self.frames.capacity() * std::mem::size_of::<SavedFrame>()
    }

    /// Drop the top `num` elements, leaving frames as they empty.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `num` elements are on the stack.
    #[track_caller]
    pub fn discard(&mut self, mut num: usize) {
        loop {
            let live = self.frame_len();
            if live >= num {
                break;
            }
            self.leave();
            num -= live;
        }
        let keep = self.states.len() - num;
        self.states.truncate(keep);
        self.frame_size -= num;
    }

    /// Remove everything, frames included.
    pub fn clear(&mut self) {
        self.states.clear();
        self.frames.clear();
        self.frame_size = 0;
        self.frame_bottom = 0;
    }

    /// Lowest live element of the current frame.
    pub fn bottom(&mut self) -> Option<&T> {
        if self.frame_len() == 0 {
            self.clean_frame();
            return None;
        }
        let idx = self.states.len() - self.frame_len();
        Some(&self.states[idx])
    }

    /// Consume the lowest live element of the current frame.
    ///
    /// The element stays physically present until the frame is observed
    /// empty.
    ///
    /// # Panics
    ///
    /// Panics if the current frame is empty.
    #[track_caller]
    pub fn pop_bottom(&mut self) -> &T {
        assert!(self.frame_len() > 0, "pop bottom on empty frame");
        let idx = self.states.len() - self.frame_len();
        self.frame_bottom += 1;
        &self.states[idx]
    }

    /// Visit the element that opened each closed frame, deepest first
    /// (`peek(1)`, `peek(2)`, ...), stopping when `visit` breaks.
    pub fn walk_up<B>(&self, mut visit: impl FnMut(&T) -> ControlFlow<B>) -> ControlFlow<B> {
        for frame_offset in 1..=self.frames.len() {
            visit(self.peek(frame_offset))?;
        }
        ControlFlow::Continue(())
    }

    /// Like [`walk_up`](Self::walk_up), starting from the root.
    pub fn walk_down<B>(&self, mut visit: impl FnMut(&T) -> ControlFlow<B>) -> ControlFlow<B> {
        for frame_offset in (1..=self.frames.len()).rev() {
            visit(self.peek(frame_offset))?;
        }
        ControlFlow::Continue(())
    }

    fn clean_frame(&mut self) {
        if self.frame_bottom > 0 {
            let keep = self.states.len() - self.frame_bottom;
            self.states.truncate(keep);
            self.frame_bottom = 0;
            self.frame_size = 0;
        }
    }
}
