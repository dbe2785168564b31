//! Signal bridge
//!
//! Turns asynchronous signals into ordinary readiness on a socket so that
//! signal watchers are dispatched from the loop like any other watcher.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    }
}
