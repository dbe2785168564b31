//! Leveled diagnostics for revent
//!
//! Writes to stderr under the stderr lock so lines from different threads do
//! not interleave. A process-wide callback can take over the output entirely,
//! which is how embedding programs route loop warnings into their own logger.
//!
//! # Environment Variables
//!
//! - `REVENT_FLUSH_EPRINT=1` - Flush stderr after each line
//! - `REVENT_LOG_LEVEL=<level>` - off/error/warn/info/debug/trace or 0-5
//!
//! # Usage
//!
//! ```ignore
//! use revent_core::{ev_debug, ev_warn, ev_msg};
//!
//! ev_warn!("epoll_ctl: fd {} rejected", fd);
//! ev_debug!("dispatch: {} ready", n);
//! ev_msg!("revent using: {}", name);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::RwLock;

/// Log levels, ordered from quiet to verbose
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit; unknown strings yield `None`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "[msg]  ",
            LogLevel::Error => "[err]  ",
            LogLevel::Warn => "[warn] ",
            LogLevel::Info => "[info] ",
            LogLevel::Debug => "[debug]",
            LogLevel::Trace => "[trace]",
        }
    }
}

/// Replacement sink for log lines. `LogLevel::Off` marks unconditional messages.
pub type LogCallback = fn(LogLevel, &str);

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static LOG_CALLBACK: RwLock<Option<LogCallback>> = RwLock::new(None);

/// Initialize logging from environment variables
///
/// Runs on first use; explicit calls make initialization deterministic.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    FLUSH_ENABLED.store(
        crate::env::env_get_bool("REVENT_FLUSH_EPRINT", false),
        Ordering::Relaxed,
    );

    if let Some(level) = crate::env::env_get_opt::<String>("REVENT_LOG_LEVEL")
        .as_deref()
        .and_then(LogLevel::parse)
    {
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically (overrides the environment)
pub fn set_log_level(level: LogLevel) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    init();
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Route all log output through `cb`; `None` restores stderr
pub fn set_log_callback(cb: Option<LogCallback>) {
    let mut slot = match LOG_CALLBACK.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *slot = cb;
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 <= log_level() as u8
}

fn emit(level: LogLevel, args: std::fmt::Arguments<'_>) {
    let cb = match LOG_CALLBACK.read() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    };
    if let Some(cb) = cb {
        cb(level, &args.to_string());
        return;
    }

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[doc(hidden)]
pub fn _log_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    emit(level, args);
}

#[doc(hidden)]
pub fn _msg_impl(args: std::fmt::Arguments<'_>) {
    emit(LogLevel::Off, args);
}

// ============================================================================
// Public Macros
// ============================================================================

/// Unconditional message (shown at every level, including off)
#[macro_export]
macro_rules! ev_msg {
    ($($arg:tt)*) => {{
        $crate::log::_msg_impl(format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ev_error {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Error, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ev_warn {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Warn, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ev_info {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Info, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ev_debug {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Most verbose; per-watcher chatter in the dispatch path
#[macro_export]
macro_rules! ev_trace {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Trace, format_args!($($arg)*));
    }};
}
