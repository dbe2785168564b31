//! Event base configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls on the config value
//! 2. Environment variables (`from_env`)
//! 3. Library defaults (`config::defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use revent_runtime::config::BaseConfig;
//!
//! let config = BaseConfig::from_env().num_priorities(3);
//! let base = EventBase::with_config(config)?;
//! ```

pub mod defaults;

use revent_core::env::{env_get, env_is_set};
use revent_core::EventError;

/// Settings read once when an `EventBase` is built
#[derive(Debug, Clone)]
pub struct BaseConfig {
    /// Refuse the epoll backend (`REVENT_NOEPOLL`)
    pub no_epoll: bool,
    /// Print the chosen backend (`REVENT_SHOW_METHOD`)
    pub show_method: bool,
    /// Use `CLOCK_MONOTONIC` if available (cleared by `REVENT_NOMONOTONIC`)
    pub use_monotonic: bool,
    /// Priority bands created at construction (`REVENT_PRIORITIES`)
    pub num_priorities: usize,
    /// First size of the backend's ready array
    pub initial_nevents: usize,
    /// Cap for the ready array (`REVENT_MAX_NEVENTS`)
    pub max_nevents: usize,
    /// First size of the fd table
    pub initial_nfiles: usize,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl BaseConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Environment variables (all optional):
    /// - `REVENT_NOEPOLL` - disable epoll (presence is enough)
    /// - `REVENT_SHOW_METHOD` - print the backend name (presence)
    /// - `REVENT_NOMONOTONIC` - use the wall clock (presence)
    /// - `REVENT_PRIORITIES` - number of priority bands
    /// - `REVENT_MAX_NEVENTS` - cap of the ready array
    pub fn from_env() -> Self {
        Self {
            no_epoll: defaults::NO_EPOLL || env_is_set("REVENT_NOEPOLL"),
            show_method: defaults::SHOW_METHOD || env_is_set("REVENT_SHOW_METHOD"),
            use_monotonic: defaults::USE_MONOTONIC && !env_is_set("REVENT_NOMONOTONIC"),
            num_priorities: env_get("REVENT_PRIORITIES", defaults::NUM_PRIORITIES),
            initial_nevents: defaults::INITIAL_NEVENTS,
            max_nevents: env_get("REVENT_MAX_NEVENTS", defaults::MAX_NEVENTS),
            initial_nfiles: defaults::INITIAL_NFILES,
        }
    }

    /// Library defaults only, environment ignored
    pub fn new() -> Self {
        Self {
            no_epoll: defaults::NO_EPOLL,
            show_method: defaults::SHOW_METHOD,
            use_monotonic: defaults::USE_MONOTONIC,
            num_priorities: defaults::NUM_PRIORITIES,
            initial_nevents: defaults::INITIAL_NEVENTS,
            max_nevents: defaults::MAX_NEVENTS,
            initial_nfiles: defaults::INITIAL_NFILES,
        }
    }

    // Builder methods

    pub fn no_epoll(mut self, disable: bool) -> Self {
        self.no_epoll = disable;
        self
    }

    pub fn show_method(mut self, show: bool) -> Self {
        self.show_method = show;
        self
    }

    pub fn use_monotonic(mut self, enable: bool) -> Self {
        self.use_monotonic = enable;
        self
    }

    pub fn num_priorities(mut self, n: usize) -> Self {
        self.num_priorities = n;
        self
    }

    pub fn initial_nevents(mut self, n: usize) -> Self {
        self.initial_nevents = n;
        self
    }

    pub fn max_nevents(mut self, n: usize) -> Self {
        self.max_nevents = n;
        self
    }

    pub fn initial_nfiles(mut self, n: usize) -> Self {
        self.initial_nfiles = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_priorities == 0 {
            return Err(ConfigError::InvalidValue("num_priorities must be > 0"));
        }
        if self.num_priorities > defaults::MAX_PRIORITIES {
            return Err(ConfigError::InvalidValue("num_priorities must be <= 256"));
        }
        if self.initial_nevents == 0 {
            return Err(ConfigError::InvalidValue("initial_nevents must be > 0"));
        }
        if self.max_nevents < self.initial_nevents {
            return Err(ConfigError::InvalidValue(
                "max_nevents must be >= initial_nevents",
            ));
        }
        if self.max_nevents > i32::MAX as usize {
            return Err(ConfigError::InvalidValue("max_nevents must fit in an int"));
        }
        if self.initial_nfiles == 0 {
            return Err(ConfigError::InvalidValue("initial_nfiles must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("revent base configuration:");
        eprintln!("  no_epoll:         {}", self.no_epoll);
        eprintln!("  show_method:      {}", self.show_method);
        eprintln!("  use_monotonic:    {}", self.use_monotonic);
        eprintln!("  num_priorities:   {}", self.num_priorities);
        eprintln!("  initial_nevents:  {}", self.initial_nevents);
        eprintln!("  max_nevents:      {}", self.max_nevents);
        eprintln!("  initial_nfiles:   {}", self.initial_nfiles);
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for EventError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => EventError::InvalidConfig(msg),
        }
    }
}
