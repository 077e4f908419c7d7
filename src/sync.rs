//! Shared concurrency primitives.

use std::sync::Mutex;

/// Mutex-guarded growable list.
///
/// All structural access is serialized. `snapshot` returns an independent
/// copy that stays valid while the list keeps changing underneath.
pub struct GuardedList<T> {
    items: Mutex<Vec<T>>,
}

impl<T> GuardedList<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().expect("mutex poisoned").push(item);
    }

    /// Append `item` unless an element matching `exists` is already present.
    /// Returns whether the item was added.
    pub fn push_if_absent<F>(&self, item: T, exists: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        let mut items = self.items.lock().expect("mutex poisoned");
        if items.iter().any(|i| exists(i)) {
            return false;
        }
        items.push(item);
        true
    }

    /// Remove and return the first element matching `pred`.
    pub fn remove_where<F>(&self, pred: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut items = self.items.lock().expect("mutex poisoned");
        let pos = items.iter().position(|i| pred(i))?;
        Some(items.remove(pos))
    }

    pub fn any<F>(&self, pred: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        self.items.lock().expect("mutex poisoned").iter().any(|i| pred(i))
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.items.lock().expect("mutex poisoned").clear();
    }
}

impl<T: Clone> GuardedList<T> {
    /// Return a clone of the first element matching `pred`.
    pub fn find<F>(&self, pred: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        self.items
            .lock()
            .expect("mutex poisoned")
            .iter()
            .find(|i| pred(i))
            .cloned()
    }

    /// Point-in-time copy of the list contents, in insertion order.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().expect("mutex poisoned").clone()
    }
}

impl<T> Default for GuardedList<T> {
    fn default() -> Self {
        Self::new()
    }
}
