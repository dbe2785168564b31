//! Readiness multiplexer abstraction
//!
//! A `Backend` maps file descriptors to the watchers interested in them and
//! waits for readiness. The event base talks to exactly one backend, chosen
//! once at construction by walking `BackendKind::PREFERENCE` and keeping the
//! first one that initializes.
//!
//! # Implementors
//!
//! - `EpollBackend` (Linux): one `epoll` instance, one read and one write
//!   watcher per descriptor.
//!
//! Signals never reach a backend; the base hands signal watchers to the
//! signal bridge, which wakes the backend through its own socket.

use std::os::fd::RawFd;
use std::time::Duration;

use revent_core::{ev_debug, EventError, EventId, EventResult, Events};

use crate::config::BaseConfig;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub mod epoll;
        pub use epoll::EpollBackend;
    }
}

/// One watcher made ready by a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    pub id: EventId,
    /// Ready directions (`READ`, `WRITE`, `SIGNAL`, `TIMEOUT`)
    pub events: Events,
    /// How many times the callback should run
    pub ncalls: u16,
}

/// Readiness multiplexer
///
/// **Contract:** `add` and `del` are all-or-nothing. `dispatch` blocks for
/// at most `timeout` (forever on `None`) and appends to `ready`; an
/// interrupted wait returns `Ok` with nothing appended.
pub trait Backend {
    /// Short method name, e.g. `"epoll"`
    fn name(&self) -> &'static str;

    /// Start watching `fd` for the READ/WRITE bits of `events` on behalf of `id`
    fn add(&mut self, fd: RawFd, id: EventId, events: Events) -> EventResult<()>;

    /// Stop watching the READ/WRITE bits of `events` on `fd`
    fn del(&mut self, fd: RawFd, id: EventId, events: Events) -> EventResult<()>;

    fn dispatch(&mut self, timeout: Option<Duration>, ready: &mut Vec<Activation>)
        -> EventResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Epoll,
}

impl BackendKind {
    /// Tried in this order until one initializes
    pub const PREFERENCE: &'static [BackendKind] = &[BackendKind::Epoll];

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Epoll => "epoll",
        }
    }

    pub fn init(self, config: &BaseConfig) -> EventResult<Box<dyn Backend>> {
        match self {
            BackendKind::Epoll => init_epoll(config),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn init_epoll(config: &BaseConfig) -> EventResult<Box<dyn Backend>> {
            Ok(Box::new(EpollBackend::new(config)?))
        }
    } else {
        fn init_epoll(_config: &BaseConfig) -> EventResult<Box<dyn Backend>> {
            Err(EventError::BackendUnavailable("epoll"))
        }
    }
}

/// First backend in preference order that initializes
pub fn select_backend(config: &BaseConfig) -> EventResult<Box<dyn Backend>> {
    for kind in BackendKind::PREFERENCE {
        match kind.init(config) {
            Ok(backend) => return Ok(backend),
            Err(e) => ev_debug!("backend {} skipped: {}", kind.name(), e),
        }
    }
    Err(EventError::NoBackend)
}
