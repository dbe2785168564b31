//! Array-backed binary min-heap of timer deadlines
//!
//! Unlike `std::collections::BinaryHeap` this heap supports removing an
//! arbitrary element in O(log n). To make that possible, every time an entry
//! lands at a new position the heap reports `(key, Some(index))` to a tracker
//! closure, and every entry leaving the heap is reported as `(key, None)`.
//! The event base uses this to keep each watcher's `heap_idx` current.
//!
//! # Complexity
//!
//! - push / pop / erase: O(log n)
//! - peek / len / is_empty: O(1)
//! - shift_earlier: O(n), order preserved without re-heapifying

use crate::error::EventResult;
use crate::Timestamp;

/// One heap slot: absolute deadline plus the owner's key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapEntry<K> {
    pub deadline: Timestamp,
    pub key: K,
}

/// Binary min-heap ordered by deadline
pub struct MinHeap<K> {
    entries: Vec<HeapEntry<K>>,
}

impl<K: Copy> MinHeap<K> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Make room for `additional` pushes that cannot fail
    ///
    /// All-or-nothing: on error the heap is unchanged.
    pub fn reserve(&mut self, additional: usize) -> EventResult<()> {
        self.entries.try_reserve(additional)?;
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest entry
    #[inline]
    pub fn peek(&self) -> Option<&HeapEntry<K>> {
        self.entries.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapEntry<K>> {
        self.entries.iter()
    }

    pub fn push<F>(&mut self, deadline: Timestamp, key: K, track: &mut F)
    where
        F: FnMut(K, Option<usize>),
    {
        let entry = HeapEntry { deadline, key };
        let hole = self.entries.len();
        self.entries.push(entry);
        self.shift_up(hole, entry, track);
    }

    /// Remove and return the earliest entry
    pub fn pop<F>(&mut self, track: &mut F) -> Option<HeapEntry<K>>
    where
        F: FnMut(K, Option<usize>),
    {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.erase(0, track))
    }

    /// Remove the entry at `index` (as last reported to the tracker)
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn erase<F>(&mut self, index: usize, track: &mut F) -> HeapEntry<K>
    where
        F: FnMut(K, Option<usize>),
    {
        let removed = self.entries[index];
        let last = match self.entries.pop() {
            Some(last) => last,
            None => unreachable!("index checked above"),
        };

        if index < self.entries.len() {
            // Refill the hole with the old last element, moving it whichever
            // way restores the heap property.
            if index > 0 && self.entries[(index - 1) / 2].deadline > last.deadline {
                self.shift_up(index, last, track);
            } else {
                self.shift_down(index, last, track);
            }
        }

        track(removed.key, None);
        removed
    }

    /// Move every deadline `offset` earlier (saturating at zero)
    ///
    /// Subtracting the same amount from every key is monotone, so the heap
    /// order survives without any sifting.
    pub fn shift_earlier(&mut self, offset: Timestamp) {
        for entry in &mut self.entries {
            entry.deadline = entry.deadline.saturating_sub(offset);
        }
    }

    fn shift_up<F>(&mut self, mut hole: usize, entry: HeapEntry<K>, track: &mut F)
    where
        F: FnMut(K, Option<usize>),
    {
        while hole > 0 {
            let parent = (hole - 1) / 2;
            if self.entries[parent].deadline <= entry.deadline {
                break;
            }
            self.entries[hole] = self.entries[parent];
            track(self.entries[hole].key, Some(hole));
            hole = parent;
        }
        self.entries[hole] = entry;
        track(entry.key, Some(hole));
    }

    fn shift_down<F>(&mut self, mut hole: usize, entry: HeapEntry<K>, track: &mut F)
    where
        F: FnMut(K, Option<usize>),
    {
        let n = self.entries.len();
        let mut child = 2 * (hole + 1);
        while child <= n {
            if child == n || self.entries[child].deadline > self.entries[child - 1].deadline {
                child -= 1;
            }
            if entry.deadline <= self.entries[child].deadline {
                break;
            }
            self.entries[hole] = self.entries[child];
            track(self.entries[hole].key, Some(hole));
            hole = child;
            child = 2 * (hole + 1);
        }
        self.entries[hole] = entry;
        track(entry.key, Some(hole));
    }
}

impl<K: Copy> Default for MinHeap<K> {
    fn default() -> Self {
        Self::new()
    }
}
