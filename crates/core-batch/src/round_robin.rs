//! Round-robin container with a movable pointer
//!
//! A [`Loop`] cycles through a set of opaque handles (building ids, manufacture
//! ids, pipe indexes) one item per call to [`Loop::next`]. It knows nothing
//! about pipelines; callers decide what a "visit" means.
//!
//! # Pointer Semantics
//!
//! - `next` returns the item under the pointer and advances it (wrapping).
//! - `add` inserts immediately *before* the pointer and then advances the
//!   pointer past the new item, so an item added mid-sweep is visited last in
//!   the current sweep and kept for the next one.
//! - `remove` deletes the nearest occurrence at or after the pointer (wrapping
//!   around), keeping the pointer on the same logical next item.
//!
//! # Example
//!
//! ```
//! use manufactory_core_batch::round_robin::Loop;
//!
//! let mut items = Loop::new(vec![1, 2, 3]);
//! assert_eq!(items.next(), Some(1));
//! assert_eq!(items.next(), Some(2));
//! assert_eq!(items.next(), Some(3));
//! assert_eq!(items.next(), Some(1)); // wraps
//! ```

/// Round-robin set of handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop<T> {
    items: Vec<T>,
    pointer: usize,
}

impl<T> Default for Loop<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            pointer: 0,
        }
    }
}

impl<T: PartialEq + Clone> Loop<T> {
    /// Create a loop over the given items, pointing at the first one
    pub fn new(items: Vec<T>) -> Self {
        Self { items, pointer: 0 }
    }

    /// Insert an item right before the pointer and step over it.
    pub fn add(&mut self, item: T) {
        let at = self.pointer.min(self.items.len());
        self.items.insert(at, item);
        self.pointer = (at + 1) % self.items.len();
    }

    /// Add an item only if it is not already present.
    ///
    /// Returns `true` if the item was inserted.
    pub fn add_unique(&mut self, item: T) -> bool {
        if self.has(&item) {
            return false;
        }
        self.add(item);
        true
    }

    /// Remove the nearest occurrence of `item` at or after the pointer.
    ///
    /// Returns `true` if something was removed.
    pub fn remove(&mut self, item: &T) -> bool {
        let len = self.items.len();
        if len == 0 {
            return false;
        }

        let found = (0..len)
            .map(|offset| (self.pointer + offset) % len)
            .find(|&index| &self.items[index] == item);

        let Some(index) = found else {
            return false;
        };

        self.items.remove(index);
        if index < self.pointer {
            self.pointer -= 1;
        }
        if self.pointer >= self.items.len() {
            self.pointer = 0;
        }
        true
    }

    /// Return the item under the pointer and advance.
    ///
    /// `None` only when the loop is empty; use [`Loop::is_empty`] to tell an
    /// empty loop apart from a generic "nothing" value of `T`.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let item = self.items[self.pointer].clone();
        self.pointer = (self.pointer + 1) % self.items.len();
        Some(item)
    }

    /// Index of the item the next call to [`Loop::next`] will return.
    pub fn position(&self) -> usize {
        self.pointer
    }

    pub fn has(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Items in storage order (not visiting order).
    pub fn items(&self) -> &[T] {
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_wraps_around() {
        let mut items = Loop::new(vec![1, 2, 3]);
        assert_eq!(items.next(), Some(1));
        assert_eq!(items.next(), Some(2));
        assert_eq!(items.next(), Some(3));
        assert_eq!(items.next(), Some(1));
    }

    #[test]
    fn test_next_on_empty() {
        let mut items: Loop<u32> = Loop::default();
        assert!(items.is_empty());
        assert_eq!(items.next(), None);
    }

    #[test]
    fn test_add_is_visited_last_in_current_sweep() {
        let mut items = Loop::new(vec![1, 2, 3]);
        assert_eq!(items.next(), Some(1));

        // Pointer sits on 2; 4 goes right before it.
        items.add(4);
        assert_eq!(items.next(), Some(2));
        assert_eq!(items.next(), Some(3));
        assert_eq!(items.next(), Some(1));
        assert_eq!(items.next(), Some(4));
        assert_eq!(items.next(), Some(2));
    }

    #[test]
    fn test_add_into_empty_loop() {
        let mut items = Loop::default();
        items.add("a");
        assert_eq!(items.len(), 1);
        assert_eq!(items.next(), Some("a"));
        assert_eq!(items.next(), Some("a"));
    }

    #[test]
    fn test_add_unique() {
        let mut items = Loop::new(vec![1, 2]);
        assert!(!items.add_unique(2));
        assert!(items.add_unique(3));
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_remove_behind_pointer_keeps_next_item() {
        let mut items = Loop::new(vec![1, 2, 3, 4]);
        items.next();
        items.next();
        // Pointer on 3, remove 1 (behind it via wrap-around search)
        assert!(items.remove(&1));
        assert_eq!(items.next(), Some(3));
        assert_eq!(items.next(), Some(4));
        assert_eq!(items.next(), Some(2));
    }

    #[test]
    fn test_remove_at_pointer() {
        let mut items = Loop::new(vec![1, 2, 3]);
        items.next();
        assert!(items.remove(&2));
        assert_eq!(items.next(), Some(3));
        assert_eq!(items.next(), Some(1));
    }

    #[test]
    fn test_remove_last_element_wraps_pointer() {
        let mut items = Loop::new(vec![1, 2, 3]);
        items.next();
        items.next();
        assert!(items.remove(&3));
        assert_eq!(items.next(), Some(1));
    }

    #[test]
    fn test_remove_prefers_occurrence_after_pointer() {
        let mut items = Loop::new(vec![7, 1, 7, 2]);
        items.next();
        items.next();
        // Pointer on index 2; the 7 at index 2 goes, not the one at index 0.
        assert!(items.remove(&7));
        assert_eq!(items.items(), &[7, 1, 2]);
        assert_eq!(items.next(), Some(2));
    }

    #[test]
    fn test_remove_missing() {
        let mut items = Loop::new(vec![1]);
        assert!(!items.remove(&9));
        assert!(items.remove(&1));
        assert!(items.is_empty());
        assert!(!items.remove(&1));
    }

    #[test]
    fn test_has() {
        let items = Loop::new(vec!["x", "y"]);
        assert!(items.has(&"x"));
        assert!(!items.has(&"z"));
    }
}
