//! # revent-core
//!
//! Platform-agnostic building blocks for the revent event loop.
//!
//! Nothing in here touches epoll or signals; those live in `revent-runtime`.
//! The only OS contact is the descriptor I/O helpers on [`Buffer`].
//!
//! ## Modules
//!
//! - `buffer` - Growable byte buffer with a change observer
//! - `min_heap` - Timer min-heap with index tracking
//! - `slab` - Generational arena holding watchers
//! - `id` - Watcher handle type
//! - `flags` - Interest, membership, loop and buffered-I/O flag sets
//! - `error` - Error types
//! - `log` - Leveled diagnostics macros
//! - `env` - Environment variable utilities

pub mod buffer;
pub mod env;
pub mod error;
pub mod flags;
pub mod id;
pub mod log;
pub mod min_heap;
pub mod slab;

pub use buffer::Buffer;
pub use env::{env_get, env_get_bool, env_get_opt, env_is_set};
pub use error::{EventError, EventResult};
pub use flags::{BevFlags, Events, ListFlags, LoopFlags};
pub use id::EventId;
pub use min_heap::{HeapEntry, MinHeap};
pub use slab::Slab;

/// Point on the loop's clock, measured from the clock's epoch
pub type Timestamp = std::time::Duration;

pub mod constants {
    /// Highest signal number the bridge accepts, plus one
    pub const NSIG: usize = 65;

    /// Longest single backend wait; longer timeouts just loop again
    pub const MAX_WAIT_MS: u64 = 35 * 60 * 1000;
}
