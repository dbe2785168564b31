//! Loop clock
//!
//! Timestamps are `Duration`s since the clock's own epoch. With
//! `CLOCK_MONOTONIC` they never go backwards; with the wall clock the base
//! has to detect regressions itself and shift pending deadlines.

use revent_core::{EventError, EventResult, Timestamp};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    Monotonic,
    Realtime,
}

impl ClockKind {
    fn clock_id(self) -> libc::clockid_t {
        match self {
            ClockKind::Monotonic => libc::CLOCK_MONOTONIC,
            ClockKind::Realtime => libc::CLOCK_REALTIME,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    kind: ClockKind,
}

impl Clock {
    /// Probe `CLOCK_MONOTONIC` once; fall back to the wall clock if it is
    /// unavailable or not wanted
    pub fn detect(prefer_monotonic: bool) -> Self {
        let kind = if prefer_monotonic && read_clock(ClockKind::Monotonic).is_ok() {
            ClockKind::Monotonic
        } else {
            ClockKind::Realtime
        };
        Clock { kind }
    }

    #[inline]
    pub fn kind(&self) -> ClockKind {
        self.kind
    }

    #[inline]
    pub fn is_monotonic(&self) -> bool {
        self.kind == ClockKind::Monotonic
    }

    pub fn now(&self) -> EventResult<Timestamp> {
        read_clock(self.kind)
    }
}

fn read_clock(kind: ClockKind) -> EventResult<Timestamp> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid timespec for the kernel to fill
    let ret = unsafe { libc::clock_gettime(kind.clock_id(), &mut ts) };
    if ret == -1 {
        return Err(EventError::last_os_error());
    }
    Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}
