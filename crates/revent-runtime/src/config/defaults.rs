//! Library defaults for `BaseConfig`
//!
//! Each value can be overridden at runtime through the matching
//! `REVENT_*` environment variable.

/// Number of priority bands a new base starts with
pub const NUM_PRIORITIES: usize = 1;

/// Upper bound accepted for `num_priorities`
pub const MAX_PRIORITIES: usize = 256;

/// Skip the epoll backend
pub const NO_EPOLL: bool = false;

/// Announce the selected backend on stderr
pub const SHOW_METHOD: bool = false;

/// Prefer `CLOCK_MONOTONIC` when the kernel provides it
pub const USE_MONOTONIC: bool = true;

/// Initial size of the epoll event array
pub const INITIAL_NEVENTS: usize = 32;

/// Cap on the epoll event array after doubling
pub const MAX_NEVENTS: usize = 4096;

/// Initial size of the fd-to-watcher table
pub const INITIAL_NFILES: usize = 32;
