//! Unix signal bridge (self-pipe over a socketpair)
//!
//! # Process-wide state
//!
//! The OS handler cannot reach a particular base, so it only touches
//! statics: a per-signal delivery counter and the sending end of the
//! socketpair belonging to the bridge that most recently registered a
//! signal. A bridge clears the notify descriptor on drop if it still points
//! at its own socket.
//!
//! "Caught" is tracked per bridge: it is the readability of that bridge's
//! receiving socket, which only the base owning the bridge watches. A base
//! with no signal watchers never looks at the counters.
//!
//! # Flow
//!
//! ```text
//!  kernel -> handle_signal: SIG_COUNTS[signo] += 1, send(1 byte)
//!  loop   -> backend wakes on the receiving end (internal READ watcher)
//!  loop   -> drain() then collect(): one Activation per watcher, ncalls = count
//! ```

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use revent_core::constants::NSIG;
use revent_core::{ev_debug, ev_warn, EventError, EventId, EventResult, Events};

use crate::backend::Activation;

static SIG_COUNTS: [AtomicUsize; NSIG] = [const { AtomicUsize::new(0) }; NSIG];
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;

        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__errno_location()
        }
    } else {
        const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__error()
        }
    }
}

/// Async-signal-safe handler: atomics and one `send(2)`, errno preserved
extern "C" fn handle_signal(signo: libc::c_int) {
    // SAFETY: errno is thread-local and always addressable
    let saved_errno = unsafe { *errno_location() };

    if signo > 0 && (signo as usize) < NSIG {
        SIG_COUNTS[signo as usize].fetch_add(1, Ordering::SeqCst);
    }

    let fd = NOTIFY_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = b"a";
        // SAFETY: send is async-signal-safe; a full socket just drops the wakeup
        unsafe {
            libc::send(
                fd,
                byte.as_ptr() as *const libc::c_void,
                1,
                SEND_FLAGS,
            );
        }
    }

    // SAFETY: see above
    unsafe { *errno_location() = saved_errno };
}

fn to_signal(signo: i32) -> EventResult<Signal> {
    if signo <= 0 || signo as usize >= NSIG {
        return Err(EventError::InvalidSignal(signo));
    }
    Signal::try_from(signo).map_err(|_| EventError::InvalidSignal(signo))
}

/// Per-base half of the bridge
pub struct SignalBridge {
    /// Written by the handler
    sender: OwnedFd,
    /// Watched by the base's internal READ watcher
    receiver: OwnedFd,
    /// Watchers per signal number
    watchers: Vec<Vec<EventId>>,
    /// Disposition in effect before our handler went in
    saved: Vec<Option<SigAction>>,
}

impl SignalBridge {
    pub fn new() -> EventResult<Self> {
        let (sender, receiver) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| EventError::Os(e as i32))?;

        let mut watchers = Vec::new();
        watchers.try_reserve_exact(NSIG)?;
        watchers.resize_with(NSIG, Vec::new);

        let mut saved = Vec::new();
        saved.try_reserve_exact(NSIG)?;
        saved.resize_with(NSIG, || None);

        Ok(Self {
            sender,
            receiver,
            watchers,
            saved,
        })
    }

    /// Descriptor the base must watch for wakeups
    #[inline]
    pub fn receiver_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }

    /// Signals with at least one watcher
    pub fn watched(&self) -> impl Iterator<Item = i32> + '_ {
        self.watchers
            .iter()
            .enumerate()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(signo, _)| signo as i32)
    }

    /// Register `id` for `signo`, installing the handler on first use
    pub fn add(&mut self, signo: i32, id: EventId) -> EventResult<()> {
        let signal = to_signal(signo)?;
        let slot = signo as usize;

        self.watchers[slot].try_reserve(1)?;

        if self.watchers[slot].is_empty() {
            let action = SigAction::new(
                SigHandler::Handler(handle_signal),
                SaFlags::SA_RESTART,
                SigSet::all(),
            );
            // SAFETY: handle_signal only touches atomics, errno and send(2)
            let old = unsafe { sigaction(signal, &action) }.map_err(|e| {
                ev_warn!("sigaction({:?}): {}", signal, e);
                EventError::Os(e as i32)
            })?;
            self.saved[slot] = Some(old);
            ev_debug!("signal bridge: handler installed for {:?}", signal);
        }

        NOTIFY_FD.store(self.sender.as_raw_fd(), Ordering::SeqCst);
        self.watchers[slot].push(id);
        Ok(())
    }

    /// Unregister `id`; the last watcher of a signal restores the old handler
    pub fn del(&mut self, signo: i32, id: EventId) -> EventResult<()> {
        let signal = to_signal(signo)?;
        let slot = signo as usize;

        let ids = &mut self.watchers[slot];
        let Some(pos) = ids.iter().position(|&w| w == id) else {
            return Ok(());
        };
        ids.remove(pos);

        if ids.is_empty() {
            // Deliveries nobody collected must not reach a later watcher
            SIG_COUNTS[slot].store(0, Ordering::SeqCst);
            self.restore(signal, slot)?;
        }
        Ok(())
    }

    fn restore(&mut self, signal: Signal, slot: usize) -> EventResult<()> {
        if let Some(old) = self.saved[slot].take() {
            // SAFETY: re-installing a disposition the process had before
            unsafe { sigaction(signal, &old) }.map_err(|e| {
                ev_warn!("sigaction restore({:?}): {}", signal, e);
                EventError::Os(e as i32)
            })?;
            ev_debug!("signal bridge: handler restored for {:?}", signal);
        }
        Ok(())
    }

    /// Empty the notification socket
    pub fn drain(&self) {
        let mut buf = [0u8; 1024];
        loop {
            // SAFETY: buf is valid for buf.len() bytes
            let n = unsafe {
                libc::recv(
                    self.receiver.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// One activation per watcher of every signal delivered since the last
    /// call, carrying the delivery count
    ///
    /// Every counter is reset, watched or not. Call after `drain` so that a
    /// signal whose byte was consumed is always counted here.
    pub fn collect(&self, ready: &mut Vec<Activation>) {
        for (signo, ids) in self.watchers.iter().enumerate() {
            if SIG_COUNTS[signo].load(Ordering::SeqCst) == 0 {
                continue;
            }
            let count = SIG_COUNTS[signo].swap(0, Ordering::SeqCst);
            if count == 0 || ids.is_empty() {
                continue;
            }
            let ncalls = count.min(u16::MAX as usize) as u16;
            ready.extend(ids.iter().map(|&id| Activation {
                id,
                events: Events::SIGNAL,
                ncalls,
            }));
        }
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for slot in 0..NSIG {
            if self.saved[slot].is_none() {
                continue;
            }
            if let Ok(signal) = to_signal(slot as i32) {
                let _ = self.restore(signal, slot);
            }
        }
        let _ = NOTIFY_FD.compare_exchange(
            self.sender.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl std::fmt::Debug for SignalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBridge")
            .field("receiver", &self.receiver_fd())
            .field("watched", &self.watched().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Counters and the notify descriptor are shared by every bridge
    static SERIAL: Mutex<()> = Mutex::new(());

    fn raise(signo: i32) {
        // SAFETY: callers install a handler for signo first
        unsafe { libc::raise(signo) };
    }

    fn pending_bytes(bridge: &SignalBridge) -> usize {
        let mut buf = [0u8; 64];
        // SAFETY: buf is valid for buf.len() bytes
        let n = unsafe {
            libc::recv(
                bridge.receiver_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        n.max(0) as usize
    }

    #[test]
    fn test_invalid_signal() {
        let mut bridge = SignalBridge::new().unwrap();
        let id = EventId::new(0, 0);
        assert_eq!(bridge.add(0, id), Err(EventError::InvalidSignal(0)));
        assert_eq!(bridge.add(NSIG as i32, id), Err(EventError::InvalidSignal(NSIG as i32)));
    }

    #[test]
    fn test_raise_counts_and_wakes() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let mut bridge = SignalBridge::new().unwrap();
        let a = EventId::new(1, 0);
        let b = EventId::new(2, 0);
        bridge.add(libc::SIGWINCH, a).unwrap();
        bridge.add(libc::SIGWINCH, b).unwrap();
        assert_eq!(bridge.watched().collect::<Vec<_>>(), vec![libc::SIGWINCH]);

        raise(libc::SIGWINCH);
        raise(libc::SIGWINCH);
        assert_eq!(SIG_COUNTS[libc::SIGWINCH as usize].load(Ordering::SeqCst), 2);
        assert_eq!(pending_bytes(&bridge), 2);

        let mut ready = Vec::new();
        bridge.collect(&mut ready);
        assert_eq!(ready.len(), 2);
        assert!(ready.iter().all(|r| r.events == Events::SIGNAL && r.ncalls == 2));
        assert_eq!(SIG_COUNTS[libc::SIGWINCH as usize].load(Ordering::SeqCst), 0);

        bridge.drain();
        ready.clear();
        bridge.collect(&mut ready);
        assert!(ready.is_empty());

        bridge.del(libc::SIGWINCH, a).unwrap();
        bridge.del(libc::SIGWINCH, b).unwrap();
        assert_eq!(bridge.watched().count(), 0);
    }

    #[test]
    fn test_uncollected_delivery_dies_with_last_watcher() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let mut bridge = SignalBridge::new().unwrap();
        let first = EventId::new(1, 0);
        let later = EventId::new(2, 0);
        let urgent = EventId::new(3, 0);

        bridge.add(libc::SIGWINCH, first).unwrap();
        raise(libc::SIGWINCH);
        bridge.del(libc::SIGWINCH, first).unwrap();

        bridge.add(libc::SIGWINCH, later).unwrap();
        bridge.add(libc::SIGURG, urgent).unwrap();
        raise(libc::SIGURG);

        bridge.drain();
        let mut ready = Vec::new();
        bridge.collect(&mut ready);
        assert_eq!(
            ready,
            vec![Activation { id: urgent, events: Events::SIGNAL, ncalls: 1 }]
        );

        bridge.del(libc::SIGWINCH, later).unwrap();
        bridge.del(libc::SIGURG, urgent).unwrap();
    }

    #[test]
    fn test_collect_resets_unwatched_counters() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let mut bridge = SignalBridge::new().unwrap();
        let id = EventId::new(1, 0);
        bridge.add(libc::SIGURG, id).unwrap();

        // A count left behind for a signal this bridge does not watch
        SIG_COUNTS[libc::SIGWINCH as usize].fetch_add(1, Ordering::SeqCst);

        let mut ready = Vec::new();
        bridge.collect(&mut ready);
        assert!(ready.is_empty());
        assert_eq!(SIG_COUNTS[libc::SIGWINCH as usize].load(Ordering::SeqCst), 0);

        bridge.add(libc::SIGWINCH, EventId::new(2, 0)).unwrap();
        raise(libc::SIGURG);
        bridge.collect(&mut ready);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, id);

        bridge.drain();
        bridge.del(libc::SIGWINCH, EventId::new(2, 0)).unwrap();
        bridge.del(libc::SIGURG, id).unwrap();
    }
}
