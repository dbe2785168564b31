//! epoll backend
//!
//! Each descriptor is registered with epoll at most once, with a mask that
//! is the union of its read and write watchers. The epoll user data carries
//! the descriptor itself; the fd table maps it back to watcher ids.
//!
//! ```text
//!  fds[fd] = { read: Some(id_a), write: None }   ->  EPOLLIN
//!  fds[fd] = { read: Some(id_a), write: Some(id_b) } ->  EPOLLIN | EPOLLOUT
//! ```

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use revent_core::constants::MAX_WAIT_MS;
use revent_core::{ev_debug, ev_trace, ev_warn, EventError, EventId, EventResult, Events};

use super::{Activation, Backend};
use crate::config::BaseConfig;

/// Watchers registered on one descriptor
#[derive(Debug, Clone, Copy, Default)]
struct FdSlot {
    read: Option<EventId>,
    write: Option<EventId>,
}

impl FdSlot {
    fn mask(&self) -> u32 {
        let mut mask = 0;
        if self.read.is_some() {
            mask |= libc::EPOLLIN as u32;
        }
        if self.write.is_some() {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }
}

pub struct EpollBackend {
    epfd: OwnedFd,
    fds: Vec<FdSlot>,
    events: Vec<libc::epoll_event>,
    max_nevents: usize,
}

impl EpollBackend {
    /// Create the epoll instance
    ///
    /// Refuses with `BackendUnavailable` when disabled by configuration
    /// (`REVENT_NOEPOLL`) or when the kernel lacks epoll.
    pub fn new(config: &BaseConfig) -> EventResult<Self> {
        if config.no_epoll {
            return Err(EventError::BackendUnavailable("epoll"));
        }

        // SAFETY: plain syscall, result checked
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw == -1 {
            let err = EventError::last_os_error();
            ev_warn!("epoll_create1: {}", err);
            return Err(EventError::BackendUnavailable("epoll"));
        }
        // SAFETY: raw is a fresh descriptor we exclusively own
        let epfd = unsafe { OwnedFd::from_raw_fd(raw) };

        let nevents = config.initial_nevents.max(1);
        let mut events = Vec::new();
        events.try_reserve_exact(nevents)?;
        events.resize(nevents, libc::epoll_event { events: 0, u64: 0 });

        let mut fds = Vec::new();
        fds.try_reserve_exact(config.initial_nfiles)?;
        fds.resize(config.initial_nfiles, FdSlot::default());

        Ok(Self {
            epfd,
            fds,
            events,
            max_nevents: config.max_nevents.max(nevents),
        })
    }

    /// Grow the fd table by doubling until `fd` fits
    fn ensure_fd(&mut self, fd: RawFd) -> EventResult<()> {
        let fd = fd as usize;
        if fd < self.fds.len() {
            return Ok(());
        }
        let mut nfds = self.fds.len().max(1);
        while nfds <= fd {
            nfds = nfds.checked_mul(2).ok_or(EventError::OutOfMemory)?;
        }
        self.fds.try_reserve_exact(nfds - self.fds.len())?;
        self.fds.resize(nfds, FdSlot::default());
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32) -> Result<(), i32> {
        let mut ev = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        // SAFETY: ev outlives the call; the kernel copies it
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if ret == -1 {
            Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
        } else {
            Ok(())
        }
    }

    /// Number of slots in the fd table
    pub fn nfiles(&self) -> usize {
        self.fds.len()
    }

    /// Current size of the ready array
    pub fn nevents(&self) -> usize {
        self.events.len()
    }

    fn grow_events(&mut self) {
        let target = (self.events.len() * 2).min(self.max_nevents);
        if target <= self.events.len() {
            return;
        }
        // Growth is an optimization only; keep the old array on failure.
        if self.events.try_reserve_exact(target - self.events.len()).is_ok() {
            self.events.resize(target, libc::epoll_event { events: 0, u64: 0 });
            ev_debug!("epoll: ready array grown to {}", target);
        }
    }
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn add(&mut self, fd: RawFd, id: EventId, events: Events) -> EventResult<()> {
        if fd < 0 {
            return Err(EventError::Os(libc::EBADF));
        }
        self.ensure_fd(fd)?;

        let old = self.fds[fd as usize];
        let mut new = old;
        if events.contains(Events::READ) {
            new.read = Some(id);
        }
        if events.contains(Events::WRITE) {
            new.write = Some(id);
        }

        let (op, retry) = if old.mask() == 0 {
            (libc::EPOLL_CTL_ADD, libc::EPOLL_CTL_MOD)
        } else {
            (libc::EPOLL_CTL_MOD, libc::EPOLL_CTL_ADD)
        };

        let result = match self.ctl(op, fd, new.mask()) {
            // The kernel's view can differ from ours after a close/dup cycle.
            Err(libc::EEXIST) if op == libc::EPOLL_CTL_ADD => self.ctl(retry, fd, new.mask()),
            Err(libc::ENOENT) if op == libc::EPOLL_CTL_MOD => self.ctl(retry, fd, new.mask()),
            other => other,
        };
        if let Err(errno) = result {
            ev_warn!("epoll_ctl add fd {}: {}", fd, std::io::Error::from_raw_os_error(errno));
            return Err(EventError::Os(errno));
        }

        self.fds[fd as usize] = new;
        Ok(())
    }

    fn del(&mut self, fd: RawFd, id: EventId, events: Events) -> EventResult<()> {
        if fd < 0 || fd as usize >= self.fds.len() {
            return Ok(());
        }

        // A slot taken over by a later watcher is not ours to clear.
        let old = self.fds[fd as usize];
        let mut new = old;
        if events.contains(Events::READ) && old.read == Some(id) {
            new.read = None;
        }
        if events.contains(Events::WRITE) && old.write == Some(id) {
            new.write = None;
        }
        if new.mask() == old.mask() {
            return Ok(());
        }

        let (op, mask) = if new.mask() != 0 {
            (libc::EPOLL_CTL_MOD, new.mask())
        } else {
            (libc::EPOLL_CTL_DEL, 0)
        };

        match self.ctl(op, fd, mask) {
            Ok(()) => {}
            // Closing the descriptor already removed it from the epoll set.
            Err(libc::ENOENT) | Err(libc::EBADF) => {}
            Err(errno) => {
                ev_warn!("epoll_ctl del fd {}: {}", fd, std::io::Error::from_raw_os_error(errno));
                return Err(EventError::Os(errno));
            }
        }

        self.fds[fd as usize] = new;
        Ok(())
    }

    fn dispatch(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<Activation>,
    ) -> EventResult<()> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                let ms = (d.as_nanos() + 999_999) / 1_000_000;
                ms.min(MAX_WAIT_MS as u128) as libc::c_int
            }
        };

        // SAFETY: events has room for events.len() entries
        let res = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };

        if res == -1 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                return Ok(());
            }
            ev_warn!("epoll_wait: {}", std::io::Error::from_raw_os_error(errno));
            return Err(EventError::Os(errno));
        }

        let n = res as usize;
        ev_trace!("epoll_wait reports {}", n);

        for i in 0..n {
            let what = self.events[i].events;
            let fd = self.events[i].u64 as usize;
            let Some(slot) = self.fds.get(fd).copied() else {
                continue;
            };

            let hup = what & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;
            let readable = hup || what & libc::EPOLLIN as u32 != 0;
            let writable = hup || what & libc::EPOLLOUT as u32 != 0;

            match (slot.read.filter(|_| readable), slot.write.filter(|_| writable)) {
                (Some(r), Some(w)) if r == w => ready.push(Activation {
                    id: r,
                    events: Events::READ | Events::WRITE,
                    ncalls: 1,
                }),
                (r, w) => {
                    if let Some(id) = r {
                        ready.push(Activation { id, events: Events::READ, ncalls: 1 });
                    }
                    if let Some(id) = w {
                        ready.push(Activation { id, events: Events::WRITE, ncalls: 1 });
                    }
                }
            }
        }

        if n == self.events.len() {
            self.grow_events();
        }
        Ok(())
    }
}
