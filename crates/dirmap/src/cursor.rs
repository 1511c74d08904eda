//! Generic iteration and paging over a loaded result set.

/// Capability for moving through a loaded result set.
pub trait Cursor {
    /// The item the cursor yields.
    type Item;

    /// Move the pointer by `offset` and return the item it lands on.
    fn skip(&mut self, offset: isize) -> Option<&Self::Item>;

    /// Drop the loaded items and rewind.
    fn reset(&mut self);
}

/// A cursor over an in-memory list of items.
///
/// The pointer may move past either end; the cursor is then "dry" until it
/// is moved back or reloaded.
#[derive(Debug, Clone)]
pub struct RecordCursor<T> {
    items: Vec<T>,
    ptr: isize,
}

impl<T> RecordCursor<T> {
    /// Create an empty cursor.
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            ptr: 0,
        }
    }

    /// Replace the loaded items and rewind to the first one.
    pub fn load(&mut self, items: Vec<T>) -> Option<&T> {
        self.items = items;
        self.ptr = 0;
        self.current()
    }

    /// The item under the pointer.
    pub fn current(&self) -> Option<&T> {
        usize::try_from(self.ptr)
            .ok()
            .and_then(|idx| self.items.get(idx))
    }

    /// Current pointer position.
    pub fn position(&self) -> isize {
        self.ptr
    }

    /// Whether the pointer is outside the loaded items.
    pub fn dry(&self) -> bool {
        self.current().is_none()
    }

    /// Number of loaded items.
    pub fn loaded(&self) -> usize {
        self.items.len()
    }

    /// Move to the first item.
    pub fn first(&mut self) -> Option<&T> {
        self.ptr = 0;
        self.current()
    }

    /// Move to the last item.
    pub fn last(&mut self) -> Option<&T> {
        self.ptr = self.items.len() as isize - 1;
        self.current()
    }

    /// Remove the item under the pointer, leaving the pointer in place.
    pub fn remove_current(&mut self) -> Option<T> {
        let idx = usize::try_from(self.ptr).ok()?;
        (idx < self.items.len()).then(|| self.items.remove(idx))
    }
}

impl<T> Default for RecordCursor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Cursor for RecordCursor<T> {
    type Item = T;

    fn skip(&mut self, offset: isize) -> Option<&T> {
        self.ptr += offset;
        self.current()
    }

    fn reset(&mut self) {
        self.items.clear();
        self.ptr = 0;
    }
}
