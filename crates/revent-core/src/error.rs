//! Error types for the revent event loop

use core::fmt;

/// Result type for event loop operations
pub type EventResult<T> = Result<T, EventError>;

/// Errors that can occur in event loop operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Allocation failed while growing a buffer, heap or table
    OutOfMemory,

    /// Handle does not name a live watcher (freed or never allocated)
    InvalidEvent,

    /// Watcher is not registered with the loop
    NotPending,

    /// Priority band out of range
    InvalidPriority,

    /// Operation refused while watchers are active
    ActiveEvents,

    /// Signal number outside the supported range
    InvalidSignal(i32),

    /// Backend refused to initialize (disabled or unsupported)
    BackendUnavailable(&'static str),

    /// No readiness backend could be initialized
    NoBackend,

    /// Base configuration rejected by validation
    InvalidConfig(&'static str),

    /// OS error with errno
    Os(i32),
}

impl EventError {
    /// Capture the calling thread's current errno
    pub fn last_os_error() -> Self {
        EventError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::OutOfMemory => write!(f, "out of memory"),
            EventError::InvalidEvent => write!(f, "invalid event handle"),
            EventError::NotPending => write!(f, "event not pending"),
            EventError::InvalidPriority => write!(f, "invalid priority"),
            EventError::ActiveEvents => write!(f, "events are active"),
            EventError::InvalidSignal(signo) => write!(f, "invalid signal {}", signo),
            EventError::BackendUnavailable(name) => write!(f, "backend {} unavailable", name),
            EventError::NoBackend => write!(f, "no event mechanism available"),
            EventError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            EventError::Os(code) => {
                write!(f, "OS error: {}", std::io::Error::from_raw_os_error(*code))
            }
        }
    }
}

impl std::error::Error for EventError {}

impl From<std::collections::TryReserveError> for EventError {
    fn from(_: std::collections::TryReserveError) -> Self {
        EventError::OutOfMemory
    }
}

impl From<EventError> for std::io::Error {
    fn from(e: EventError) -> Self {
        match e {
            EventError::Os(code) => std::io::Error::from_raw_os_error(code),
            EventError::OutOfMemory => std::io::Error::new(std::io::ErrorKind::OutOfMemory, e),
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
