//! # Growable Deque
//!
//! Purpose: Move batches of pipeline entries between node stages (written →
//! in flight) without reallocating per entry.
//!
//! ## Design Principles
//! 1. **Ring Buffer**: `head` points at the next item to pop, `tail` at the next
//!    free slot; both wrap around the backing storage.
//! 2. **Doubling Growth**: Capacity doubles when full; growing copies items in
//!    logical order regardless of wrap state.
//! 3. **Bulk Append**: `append_all` moves another deque's contents in one pass
//!    and leaves it empty, reusing both backing buffers.
//! 4. **Versioned Iteration**: Every mutation bumps `version`; detached cursors
//!    use it to detect modification mid-iteration.
//!
//! ```text
//! contiguous            wrapped
//! ....****....          ****....****
//!     ^   ^                 ^   ^
//!     H   T                 T   H
//! ```

use std::fmt;

use thiserror::Error;

const DEFAULT_CAPACITY: usize = 4;
const GROWTH_FACTOR: usize = 2;

/// Queue misuse. These are programming errors, not operational failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DequeError {
    #[error("queue is empty")]
    Empty,
    #[error("queue has changed during iteration")]
    ConcurrentModification,
}

/// Resizable ring-buffer double-ended queue.
pub struct GrowableDeque<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    len: usize,
    version: u64,
}

impl<T> GrowableDeque<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a deque with room for `capacity` items (at least the default).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(DEFAULT_CAPACITY);
        GrowableDeque {
            slots: empty_slots(capacity),
            head: 0,
            tail: 0,
            len: 0,
            version: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Appends an item at the back.
    pub fn push_back(&mut self, item: T) {
        if self.len == self.capacity() {
            self.grow(0, 0);
        }

        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.capacity();
        self.len += 1;
        self.version += 1;
    }

    /// Inserts an item at the front.
    pub fn push_front(&mut self, item: T) {
        // Growing with a shift of one leaves slot 0 free for the new head.
        if self.len == self.capacity() {
            self.grow(1, 0);
        }

        let capacity = self.capacity();
        self.head = (capacity + self.head - 1) % capacity;
        self.slots[self.head] = Some(item);
        self.len += 1;
        self.version += 1;
    }

    /// Removes and returns the front item.
    ///
    /// # Errors
    /// Returns `DequeError::Empty` when there is nothing to pop.
    pub fn pop_front(&mut self) -> Result<T, DequeError> {
        if self.len == 0 {
            return Err(DequeError::Empty);
        }

        let item = self.slots[self.head].take().ok_or(DequeError::Empty)?;
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        self.version += 1;
        Ok(item)
    }

    /// Returns the front item without removing it.
    pub fn peek_front(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    /// Returns the front item mutably without removing it.
    pub fn peek_front_mut(&mut self) -> Option<&mut T> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_mut()
    }

    /// Moves all items of `other` to the back of `self`, preserving order.
    ///
    /// `other` is left empty but keeps its backing storage. Either deque may be
    /// in a wrapped state; `self` grows when its free space is too small.
    pub fn append_all(&mut self, other: &mut GrowableDeque<T>) {
        let incoming = other.len;
        if incoming == 0 {
            return;
        }

        if self.capacity() - self.len < incoming {
            self.grow(0, self.len + incoming);
        }

        if self.len == 0 {
            // Start at slot 0 so a contiguous source lands contiguous.
            self.head = 0;
            self.tail = 0;
        }

        let capacity = self.capacity();
        let other_capacity = other.capacity();
        for offset in 0..incoming {
            let src = (other.head + offset) % other_capacity;
            let dst = (self.tail + offset) % capacity;
            self.slots[dst] = other.slots[src].take();
        }

        self.tail = (self.tail + incoming) % capacity;
        self.len += incoming;
        self.version += 1;

        other.head = 0;
        other.tail = 0;
        other.len = 0;
        other.version += 1;
    }

    /// Drops every item.
    pub fn clear(&mut self) {
        if self.len == 0 {
            return;
        }

        let capacity = self.capacity();
        for offset in 0..self.len {
            self.slots[(self.head + offset) % capacity] = None;
        }

        self.head = 0;
        self.tail = 0;
        self.len = 0;
        self.version += 1;
    }

    /// Removes items from the front until the deque is empty.
    pub fn drain(&mut self) -> Drain<'_, T> {
        Drain { deque: self }
    }

    /// Borrowing iterator in front-to-back order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            deque: self,
            index: 0,
        }
    }

    /// Detached, version-stamped position for iterating across mutations.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            version: self.version,
            index: 0,
        }
    }

    fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.slots[(self.head + index) % self.capacity()].as_ref()
    }

    /// Reallocates the backing storage.
    ///
    /// Items are copied in logical order starting at slot `shift`; the new
    /// capacity is the doubled size or `minimum`, whichever is larger.
    fn grow(&mut self, shift: usize, minimum: usize) {
        let old_capacity = self.capacity();
        let capacity = (old_capacity * GROWTH_FACTOR)
            .max(minimum)
            .max(self.len + shift + 1);

        let mut slots = empty_slots(capacity);
        for offset in 0..self.len {
            slots[shift + offset] = self.slots[(self.head + offset) % old_capacity].take();
        }

        self.slots = slots;
        self.head = shift;
        self.tail = (shift + self.len) % capacity;
        self.version += 1;
    }
}

fn empty_slots<T>(capacity: usize) -> Vec<Option<T>> {
    let mut slots = Vec::with_capacity(capacity);
    slots.resize_with(capacity, || None);
    slots
}

impl<T> Default for GrowableDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for GrowableDeque<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T> FromIterator<T> for GrowableDeque<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut deque = GrowableDeque::new();
        for item in iter {
            deque.push_back(item);
        }
        deque
    }
}

impl<'a, T> IntoIterator for &'a GrowableDeque<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Borrowing iterator over a [`GrowableDeque`].
pub struct Iter<'a, T> {
    deque: &'a GrowableDeque<T>,
    index: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.deque.get(self.index)?;
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.deque.len - self.index.min(self.deque.len);
        (remaining, Some(remaining))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}

/// Draining iterator; see [`GrowableDeque::drain`].
pub struct Drain<'a, T> {
    deque: &'a mut GrowableDeque<T>,
}

impl<T> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.deque.pop_front().ok()
    }
}

impl<T> Drop for Drain<'_, T> {
    fn drop(&mut self) {
        self.deque.clear();
    }
}

/// Position inside a deque that does not hold a borrow.
///
/// Any mutation of the deque after the cursor was created makes the next step
/// fail with `DequeError::ConcurrentModification`.
#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    version: u64,
    index: usize,
}

impl Cursor {
    /// Advances the cursor and returns the item it passed.
    pub fn next<'a, T>(&mut self, deque: &'a GrowableDeque<T>) -> Result<Option<&'a T>, DequeError> {
        if deque.version != self.version {
            return Err(DequeError::ConcurrentModification);
        }

        let item = deque.get(self.index);
        if item.is_some() {
            self.index += 1;
        }
        Ok(item)
    }
}
