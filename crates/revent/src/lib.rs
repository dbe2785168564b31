//! # revent - readiness event loop
//!
//! A small, single-threaded I/O event-notification library: an epoll-backed
//! loop with priority bands and a timer heap, a signal bridge that turns
//! asynchronous signals into ordinary watchers, a growable byte buffer and a
//! buffered-I/O wrapper with watermarks.
//!
//! ## Quick Start
//!
//! ```ignore
//! use revent::{EventBase, Events, LoopFlags};
//! use std::time::Duration;
//!
//! fn main() -> revent::EventResult<()> {
//!     let base = EventBase::new()?;
//!
//!     let timer = base.timer_new(|_base, _id, _fd, what| {
//!         println!("fired: {:?}", what);
//!     })?;
//!     base.event_add(timer, Some(Duration::from_millis(100)))?;
//!
//!     let sig = base.signal_new(libc::SIGINT, |base, _id, signo, _| {
//!         println!("caught signal {}", signo);
//!         base.loopbreak();
//!     })?;
//!     base.event_add(sig, None)?;
//!
//!     base.run(LoopFlags::NONE)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        event_new / event_add / run, BufferEvent             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      EventBase                              │
//! │   watcher arena, priority bands, timer heap, loop control   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │   epoll   │      │  signal   │      │   clock   │
//!    │  backend  │      │  bridge   │      │           │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```

// Re-export core types
pub use revent_core::{
    BevFlags, Buffer, EventError, EventId, EventResult, Events, HeapEntry, ListFlags, LoopFlags,
    MinHeap, Slab, Timestamp,
};

// Re-export logging macros and controls
pub use revent_core::{ev_debug, ev_error, ev_info, ev_msg, ev_trace, ev_warn};
pub use revent_core::log::{
    init as init_logging, set_flush_enabled, set_log_callback, set_log_level, LogLevel,
};

// Re-export env utilities
pub use revent_core::{env_get, env_get_bool, env_get_opt, env_is_set};

// Re-export runtime types
pub use revent_runtime::{
    BaseConfig, BufferEvent, Callback, ConfigError, ErrorCallback, EventBase, LoopExit,
    ReadCallback, Watermark, WriteCallback,
};

pub mod config {
    pub use revent_runtime::config::{defaults, BaseConfig, ConfigError};
}
