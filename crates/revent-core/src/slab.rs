//! Generational arena for watchers
//!
//! Freed slots go on a LIFO free stack so a just-freed slot is the next one
//! handed out. Every free bumps the slot's generation, which turns any
//! `EventId` still pointing at it into a stale handle that `get` rejects.

use crate::error::{EventError, EventResult};
use crate::id::EventId;

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of `T` addressed by `EventId`
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_stack: Vec<u32>,
    len: usize,
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_stack: Vec::new(),
            len: 0,
        }
    }

    /// Store `value`, returning its handle
    ///
    /// Fails only if the backing vector cannot grow.
    pub fn insert(&mut self, value: T) -> EventResult<EventId> {
        if let Some(index) = self.free_stack.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            self.len += 1;
            return Ok(EventId::new(index, entry.generation));
        }

        if self.entries.len() >= u32::MAX as usize {
            return Err(EventError::OutOfMemory);
        }
        self.entries.try_reserve(1)?;
        // The free stack must be able to take every slot back without allocating.
        self.free_stack.try_reserve(self.entries.len() + 1 - self.free_stack.len())?;

        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        self.len += 1;
        Ok(EventId::new(index, 0))
    }

    /// Take the value out and retire the handle
    pub fn remove(&mut self, id: EventId) -> Option<T> {
        let entry = self.entries.get_mut(id.index())?;
        if entry.generation != id.generation() {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free_stack.push(id.index() as u32);
        self.len -= 1;
        Some(value)
    }

    #[inline]
    pub fn get(&self, id: EventId) -> Option<&T> {
        self.entries
            .get(id.index())
            .filter(|e| e.generation == id.generation())
            .and_then(|e| e.value.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, id: EventId) -> Option<&mut T> {
        self.entries
            .get_mut(id.index())
            .filter(|e| e.generation == id.generation())
            .and_then(|e| e.value.as_mut())
    }

    #[inline]
    pub fn contains(&self, id: EventId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live values
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live entries with their handles, in slot order
    pub fn iter(&self) -> impl Iterator<Item = (EventId, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.value
                .as_ref()
                .map(|v| (EventId::new(i as u32, e.generation), v))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EventId, &mut T)> {
        self.entries.iter_mut().enumerate().filter_map(|(i, e)| {
            let generation = e.generation;
            e.value
                .as_mut()
                .map(move |v| (EventId::new(i as u32, generation), v))
        })
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}
