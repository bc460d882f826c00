//! Recency-ordered min-heap with handle tracking.
//!
//! Entries are stored in a slab and the heap itself is a vector of slab keys
//! ordered by last activity, oldest first. Every slot records its current
//! position in that vector, so an entry can be refreshed or removed through
//! the handle returned at insertion in O(log n).
//!
//! The heap is not synchronized. Callers serialize access (see
//! [`ConnectionPool`](crate::pool::ConnectionPool)).

use slab::Slab;
use std::time::Instant;

/// Stable reference to a heap entry.
///
/// Slab slots are reused, so a handle also carries the generation it was
/// issued with. A handle to a removed entry never matches a newer entry
/// occupying the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle {
    slot: usize,
    generation: u64,
}

impl HeapHandle {
    /// Unique, monotonically increasing identifier of this entry.
    pub fn id(&self) -> u64 {
        self.generation
    }
}

struct Slot<T> {
    generation: u64,
    last_activity: Instant,
    /// Index into `RecencyHeap::order`.
    position: usize,
    value: T,
}

/// Min-heap of values keyed by their last activity time.
pub struct RecencyHeap<T> {
    slots: Slab<Slot<T>>,
    order: Vec<usize>,
    next_generation: u64,
}

impl<T> RecencyHeap<T> {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            order: Vec::new(),
            next_generation: 1,
        }
    }

    /// Number of entries currently in the heap.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert a value with the given activity time.
    #[cfg(test)]
    pub fn push(&mut self, last_activity: Instant, value: T) -> HeapHandle {
        let handle = self.next_handle();
        self.insert(handle, last_activity, value);
        handle
    }

    /// Insert a value built from its own handle.
    ///
    /// Used when the stored value needs to know how to find itself again.
    pub fn push_with<F>(&mut self, last_activity: Instant, make: F) -> &T
    where
        F: FnOnce(HeapHandle) -> T,
    {
        let handle = self.next_handle();
        let value = make(handle);
        self.insert(handle, last_activity, value);
        &self.slots[handle.slot].value
    }

    /// Remove and return the entry with the oldest activity.
    pub fn pop_min(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        self.remove_at(0)
    }

    /// Set a new activity time for an entry and restore heap order.
    ///
    /// Returns `false` without doing anything if the handle is no longer in
    /// the heap.
    pub fn update(&mut self, handle: HeapHandle, last_activity: Instant) -> bool {
        let Some(position) = self.position(handle) else {
            return false;
        };
        self.slots[handle.slot].last_activity = last_activity;
        self.fix(position);
        true
    }

    /// Remove an arbitrary entry.
    pub fn remove(&mut self, handle: HeapHandle) -> Option<T> {
        let position = self.position(handle)?;
        self.remove_at(position)
    }

    /// Current index of the entry in the heap order, `None` once removed.
    pub fn position(&self, handle: HeapHandle) -> Option<usize> {
        self.slots
            .get(handle.slot)
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| slot.position)
    }

    /// Activity time recorded for an entry.
    #[cfg(test)]
    pub fn last_activity(&self, handle: HeapHandle) -> Option<Instant> {
        self.slots
            .get(handle.slot)
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| slot.last_activity)
    }

    fn next_handle(&mut self) -> HeapHandle {
        let handle = HeapHandle {
            slot: self.slots.vacant_key(),
            generation: self.next_generation,
        };
        self.next_generation += 1;
        handle
    }

    fn insert(&mut self, handle: HeapHandle, last_activity: Instant, value: T) {
        let position = self.order.len();
        let slot = self.slots.insert(Slot {
            generation: handle.generation,
            last_activity,
            position,
            value,
        });
        debug_assert_eq!(slot, handle.slot);
        self.order.push(slot);
        self.sift_up(position);
    }

    fn remove_at(&mut self, position: usize) -> Option<T> {
        let last = self.order.len().checked_sub(1)?;
        self.swap(position, last);
        let key = self.order.pop()?;
        let removed = self.slots.remove(key);
        if position < self.order.len() {
            self.fix(position);
        }
        Some(removed.value)
    }

    /// Restore heap order for an element whose key changed in either direction.
    fn fix(&mut self, position: usize) {
        if !self.sift_up(position) {
            self.sift_down(position);
        }
    }

    /// Returns whether the element moved.
    fn sift_up(&mut self, mut position: usize) -> bool {
        let start = position;
        while position > 0 {
            let parent = (position - 1) / 2;
            if !self.less(position, parent) {
                break;
            }
            self.swap(position, parent);
            position = parent;
        }
        position != start
    }

    fn sift_down(&mut self, mut position: usize) {
        let len = self.order.len();
        loop {
            let left = 2 * position + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, position) {
                break;
            }
            self.swap(position, child);
            position = child;
        }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.slots[self.order[a]].last_activity < self.slots[self.order[b]].last_activity
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.order.swap(a, b);
        self.slots[self.order[a]].position = a;
        self.slots[self.order[b]].position = b;
    }
}

impl<T> Default for RecencyHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}
