//! Watcher handle type

use core::fmt;

/// Handle to a watcher living in an event base's arena
///
/// `index` picks the arena slot, `generation` tells a live handle apart from
/// a stale one after the slot has been freed and reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    index: u32,
    generation: u32,
}

impl EventId {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        EventId { index, generation }
    }

    /// Slot index for arena lookups
    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ev#{}", self.index)
    }
}
