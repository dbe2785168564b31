//! Flag sets used across the event loop
//!
//! Small `Copy` newtypes over integers. The numeric values are stable and
//! show up in log lines, so they are kept identical to the classic libevent
//! constants.

use core::fmt;
use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident($repr:ty) {
            $( $(#[$fmeta:meta])* $flag:ident = $value:expr; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($repr);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: Self = Self($value); )*

            /// The empty set
            pub const NONE: Self = Self(0);

            #[inline]
            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            #[inline]
            pub const fn bits(self) -> $repr {
                self.0
            }

            #[inline]
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// All bits of `other` are set
            #[inline]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Any bit of `other` is set
            #[inline]
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            #[inline]
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;
            #[inline]
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            #[inline]
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = Self;
            #[inline]
            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl BitAndAssign for $name {
            #[inline]
            fn bitand_assign(&mut self, rhs: Self) {
                self.0 &= rhs.0;
            }
        }

        impl Not for $name {
            type Output = Self;
            #[inline]
            fn not(self) -> Self {
                Self(!self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut first = true;
                write!(f, "{}(", stringify!($name))?;
                $(
                    if $value != 0 && self.0 & $value == $value {
                        if !first {
                            write!(f, " | ")?;
                        }
                        f.write_str(stringify!($flag))?;
                        first = false;
                    }
                )*
                if first {
                    write!(f, "{:#x}", self.0)?;
                }
                write!(f, ")")
            }
        }
    };
}

flag_set! {
    /// Watcher interest and activation result.
    ///
    /// `READ`, `WRITE`, `SIGNAL` and `PERSIST` are interest bits. `TIMEOUT`
    /// only ever appears in results handed to callbacks.
    Events(u16) {
        TIMEOUT = 0x01;
        READ = 0x02;
        WRITE = 0x04;
        SIGNAL = 0x08;
        /// Stay registered after firing
        PERSIST = 0x10;
    }
}

flag_set! {
    /// Which loop structures currently hold a watcher
    ListFlags(u16) {
        TIMEOUT = 0x01;
        INSERTED = 0x02;
        ACTIVE = 0x08;
        /// Loop-owned watcher, invisible to the "anything registered?" test
        INTERNAL = 0x10;
        INIT = 0x80;
    }
}

flag_set! {
    /// Flags for a single `run` call
    LoopFlags(u8) {
        /// Block for one batch of events, process it, return
        ONCE = 0x01;
        /// Poll without blocking, process what is ready, return
        NONBLOCK = 0x02;
    }
}

flag_set! {
    /// Direction and cause reported to a buffered-I/O error callback
    BevFlags(u8) {
        READ = 0x01;
        WRITE = 0x02;
        EOF = 0x10;
        ERROR = 0x20;
        TIMEOUT = 0x40;
    }
}

impl Events {
    /// Interest bits that put a watcher into the readiness backend
    pub const IO: Events = Events(0x02 | 0x04);
}
