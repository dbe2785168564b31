//! Environment variable helpers
//!
//! Every knob revent reads from the environment goes through here, so the
//! parsing rules (what counts as "true", what happens on garbage) are the
//! same everywhere.
//!
//! ```ignore
//! use revent_core::env::{env_get, env_is_set};
//!
//! let bands: usize = env_get("REVENT_PRIORITIES", 1);
//! let no_epoll = env_is_set("REVENT_NOEPOLL");
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, falling back to `default` when unset or unparseable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Boolean variable: "1", "true", "yes", "on" (any case) are true,
/// any other value is false, unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if the variable is set and parses
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Presence test; the value (even empty) is ignored.
///
/// The `REVENT_NO*` switches follow this rule: exporting the variable at all
/// turns the feature off.
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}
