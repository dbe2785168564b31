//! # revent-runtime
//!
//! OS-facing half of the revent event loop.
//!
//! This crate provides:
//! - The event base (watcher registration, priority dispatch, timers)
//! - The epoll readiness backend
//! - The signal bridge (self-pipe over a socketpair)
//! - Buffered I/O with watermarks on top of the base
//! - Loop clock and base configuration

pub mod backend;
pub mod base;
pub mod bufferevent;
pub mod clock;
pub mod config;
pub mod signal;

// Re-exports
pub use backend::{Activation, Backend, BackendKind};
pub use base::{Callback, EventBase, LoopExit};
pub use bufferevent::{BufferEvent, ErrorCallback, ReadCallback, Watermark, WriteCallback};
pub use clock::{Clock, ClockKind};
pub use config::{BaseConfig, ConfigError};
pub use signal::SignalBridge;
