//! Buffered I/O on a single descriptor
//!
//! A `BufferEvent` pairs an input and an output [`Buffer`] with a read and a
//! write watcher on one non-blocking fd. The loop moves bytes between the
//! descriptor and the buffers; user callbacks only see the buffers.
//!
//! # Flow control
//!
//! - Reading stops once the input holds the high watermark. An observer on
//!   the input buffer re-arms the read watcher when the application drains
//!   it below the mark, so a paused stream costs no wakeups.
//! - The read callback is held back until the input reaches the low
//!   watermark.
//! - The write watcher is armed only while output is pending; the write
//!   callback fires whenever the output is at or below the low watermark.
//!
//! Would-block and interrupted calls are retried on the next wakeup. EOF,
//! hard errors and timeouts go to the error callback and stop that
//! direction.
//!
//! # Ownership
//!
//! `BufferEvent` is a cheap handle (`Clone`). The watchers only hold weak
//! references, so dropping the last handle frees both watchers, even from
//! inside one of its own callbacks.

use std::cell::{RefCell, RefMut};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use revent_core::{ev_debug, ev_trace, ev_warn, BevFlags, Buffer, EventError, EventId, EventResult, Events};

use crate::base::EventBase;

pub type ReadCallback = Box<dyn FnMut(&BufferEvent)>;
pub type WriteCallback = Box<dyn FnMut(&BufferEvent)>;
/// Receives the direction plus `EOF`, `ERROR` or `TIMEOUT`
pub type ErrorCallback = Box<dyn FnMut(&BufferEvent, BevFlags)>;

/// Low/high byte thresholds; 0 means unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
    pub low: usize,
    pub high: usize,
}

#[derive(Debug, Default)]
struct State {
    wm_read: Watermark,
    wm_write: Watermark,
    timeout_read: Option<Duration>,
    timeout_write: Option<Duration>,
    /// READ and/or WRITE
    enabled: Events,
}

#[derive(Default)]
struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<WriteCallback>,
    error: Option<ErrorCallback>,
}

struct Shared {
    base: Rc<EventBase>,
    fd: RawFd,
    ev_read: EventId,
    ev_write: EventId,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    state: RefCell<State>,
    callbacks: RefCell<Callbacks>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.base.event_free(self.ev_read);
        let _ = self.base.event_free(self.ev_write);
        ev_debug!("bufferevent on fd {} freed", self.fd);
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::EINPROGRESS)
    ) || e.kind() == io::ErrorKind::WouldBlock
}

/// Buffered reader/writer bound to one descriptor and one event base
#[derive(Clone)]
pub struct BufferEvent {
    shared: Rc<Shared>,
}

impl BufferEvent {
    /// Wrap `fd`; writing starts enabled, reading disabled
    pub fn new(
        base: &Rc<EventBase>,
        fd: RawFd,
        read_cb: Option<ReadCallback>,
        write_cb: Option<WriteCallback>,
        error_cb: Option<ErrorCallback>,
    ) -> EventResult<Self> {
        let ev_read = base.event_new(fd, Events::READ, |_, _, _, _| {})?;
        let ev_write = match base.event_new(fd, Events::WRITE, |_, _, _, _| {}) {
            Ok(id) => id,
            Err(e) => {
                let _ = base.event_free(ev_read);
                return Err(e);
            }
        };

        let shared = Rc::new(Shared {
            base: base.clone(),
            fd,
            ev_read,
            ev_write,
            input: RefCell::new(Buffer::new()),
            output: RefCell::new(Buffer::new()),
            state: RefCell::new(State {
                enabled: Events::WRITE,
                ..State::default()
            }),
            callbacks: RefCell::new(Callbacks {
                read: read_cb,
                write: write_cb,
                error: error_cb,
            }),
        });

        let weak = Rc::downgrade(&shared);
        base.event_assign(ev_read, fd, Events::READ, move |_, _, _, res| {
            if let Some(shared) = weak.upgrade() {
                BufferEvent { shared }.handle_read(res);
            }
        })?;
        let weak = Rc::downgrade(&shared);
        base.event_assign(ev_write, fd, Events::WRITE, move |_, _, _, res| {
            if let Some(shared) = weak.upgrade() {
                BufferEvent { shared }.handle_write(res);
            }
        })?;

        ev_debug!("bufferevent on fd {}: read {:?} write {:?}", fd, ev_read, ev_write);
        Ok(Self { shared })
    }

    /// Replace all three callbacks
    pub fn set_callbacks(
        &self,
        read_cb: Option<ReadCallback>,
        write_cb: Option<WriteCallback>,
        error_cb: Option<ErrorCallback>,
    ) {
        *self.shared.callbacks.borrow_mut() = Callbacks {
            read: read_cb,
            write: write_cb,
            error: error_cb,
        };
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.shared.fd
    }

    pub fn base(&self) -> &Rc<EventBase> {
        &self.shared.base
    }

    /// Bytes read from the descriptor, not yet consumed
    pub fn input(&self) -> RefMut<'_, Buffer> {
        self.shared.input.borrow_mut()
    }

    /// Bytes queued for the descriptor
    pub fn output(&self) -> RefMut<'_, Buffer> {
        self.shared.output.borrow_mut()
    }

    pub fn enabled(&self) -> Events {
        self.shared.state.borrow().enabled
    }

    /// Queue `data` and arm the write watcher if writing is enabled
    pub fn write(&self, data: &[u8]) -> EventResult<()> {
        self.shared.output.borrow_mut().append(data)?;

        let (enabled, timeout) = {
            let st = self.shared.state.borrow();
            (st.enabled, st.timeout_write)
        };
        if enabled.contains(Events::WRITE) {
            self.shared.base.event_add(self.shared.ev_write, timeout)?;
        }
        Ok(())
    }

    /// Queue the whole of `buf`, leaving it empty
    pub fn write_buffer(&self, buf: &mut Buffer) -> EventResult<()> {
        let n = buf.len();
        self.write(buf.as_slice())?;
        buf.drain(n);
        Ok(())
    }

    /// Take up to `out.len()` bytes from the input
    pub fn read(&self, out: &mut [u8]) -> usize {
        self.shared.input.borrow_mut().remove(out)
    }

    /// Arm the watchers for `events` (READ and/or WRITE)
    pub fn enable(&self, events: Events) -> EventResult<()> {
        let (timeout_read, timeout_write) = {
            let st = self.shared.state.borrow();
            (st.timeout_read, st.timeout_write)
        };
        if events.contains(Events::READ) {
            self.shared.base.event_add(self.shared.ev_read, timeout_read)?;
        }
        if events.contains(Events::WRITE) {
            self.shared.base.event_add(self.shared.ev_write, timeout_write)?;
        }
        self.shared.state.borrow_mut().enabled |= events & Events::IO;
        Ok(())
    }

    /// Disarm the watchers for `events`
    pub fn disable(&self, events: Events) -> EventResult<()> {
        if events.contains(Events::READ) {
            self.del_quiet(self.shared.ev_read)?;
        }
        if events.contains(Events::WRITE) {
            self.del_quiet(self.shared.ev_write)?;
        }
        self.shared.state.borrow_mut().enabled &= !(events & Events::IO);
        Ok(())
    }

    fn del_quiet(&self, id: EventId) -> EventResult<()> {
        match self.shared.base.event_del(id) {
            Ok(()) | Err(EventError::NotPending) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Per-direction inactivity timeouts; pending watchers pick them up
    /// immediately
    pub fn set_timeouts(
        &self,
        timeout_read: Option<Duration>,
        timeout_write: Option<Duration>,
    ) -> EventResult<()> {
        {
            let mut st = self.shared.state.borrow_mut();
            st.timeout_read = timeout_read;
            st.timeout_write = timeout_write;
        }

        let base = &self.shared.base;
        if !base.event_pending(self.shared.ev_read, Events::READ)?.0.is_empty() {
            base.event_add(self.shared.ev_read, timeout_read)?;
        }
        if !base.event_pending(self.shared.ev_write, Events::WRITE)?.0.is_empty() {
            base.event_add(self.shared.ev_write, timeout_write)?;
        }
        Ok(())
    }

    /// Set the watermarks of the directions in `events`
    pub fn set_watermark(&self, events: Events, low: usize, high: usize) {
        {
            let mut st = self.shared.state.borrow_mut();
            if events.contains(Events::WRITE) {
                st.wm_write = Watermark { low, high };
            }
            if events.contains(Events::READ) {
                st.wm_read = Watermark { low, high };
            }
        }

        // A raised (or removed) high mark may unpause reading
        let len = self.shared.input.borrow().len();
        if !self.relieve_pressure(len) {
            return;
        }
        self.shared.input.borrow_mut().clear_callback();
    }

    pub fn watermark(&self, events: Events) -> Watermark {
        let st = self.shared.state.borrow();
        if events.contains(Events::READ) {
            st.wm_read
        } else {
            st.wm_write
        }
    }

    /// Move both watchers to band `pri`
    pub fn priority_set(&self, pri: usize) -> EventResult<()> {
        self.shared.base.event_priority_set(self.shared.ev_read, pri)?;
        self.shared.base.event_priority_set(self.shared.ev_write, pri)
    }

    /// Re-arm a watcher from inside the loop; failures only get logged
    fn schedule(&self, id: EventId, timeout: Option<Duration>) {
        if let Err(e) = self.shared.base.event_add(id, timeout) {
            ev_warn!("bufferevent on fd {}: re-arming {:?} failed: {}", self.shared.fd, id, e);
        }
    }

    /// Resume reading if the input is below the high mark; returns whether
    /// the pressure is gone
    fn relieve_pressure(&self, len: usize) -> bool {
        let (high, enabled, timeout) = {
            let st = self.shared.state.borrow();
            (st.wm_read.high, st.enabled, st.timeout_read)
        };
        if high != 0 && len >= high {
            return false;
        }
        if enabled.contains(Events::READ) {
            self.schedule(self.shared.ev_read, timeout);
        }
        true
    }

    /// Watch the input for drains instead of the descriptor for data
    fn pause_reading(&self) {
        let weak: Weak<Shared> = Rc::downgrade(&self.shared);
        self.shared.input.borrow_mut().set_callback(move |_, now| {
            let Some(shared) = weak.upgrade() else {
                return false;
            };
            !BufferEvent { shared }.relieve_pressure(now)
        });
        ev_trace!("bufferevent on fd {}: read paused at high watermark", self.shared.fd);
    }

    fn handle_read(&self, res: Events) {
        let mut what = BevFlags::READ;
        if res == Events::TIMEOUT {
            what |= BevFlags::TIMEOUT;
            return self.report_error(what);
        }

        let (wm, timeout) = {
            let st = self.shared.state.borrow();
            (st.wm_read, st.timeout_read)
        };

        let howmuch = if wm.high != 0 {
            let len = self.shared.input.borrow().len();
            if len >= wm.high {
                self.pause_reading();
                return;
            }
            Some(wm.high - len)
        } else {
            None
        };

        let result = self.shared.input.borrow_mut().read_fd(self.shared.fd, howmuch);
        match result {
            Ok(0) => {
                what |= BevFlags::EOF;
                return self.report_error(what);
            }
            Err(e) if is_transient(&e) => {
                self.schedule(self.shared.ev_read, timeout);
                return;
            }
            Err(e) => {
                ev_debug!("bufferevent on fd {}: read: {}", self.shared.fd, e);
                what |= BevFlags::ERROR;
                return self.report_error(what);
            }
            Ok(n) => ev_trace!("bufferevent on fd {}: read {} bytes", self.shared.fd, n),
        }

        self.schedule(self.shared.ev_read, timeout);

        let len = self.shared.input.borrow().len();
        if wm.low != 0 && len < wm.low {
            return;
        }
        if wm.high != 0 && len >= wm.high {
            self.pause_reading();
            let _ = self.del_quiet(self.shared.ev_read);
        }

        self.invoke_read();
    }

    fn handle_write(&self, res: Events) {
        let mut what = BevFlags::WRITE;
        if res == Events::TIMEOUT {
            what |= BevFlags::TIMEOUT;
            return self.report_error(what);
        }

        let (wm, timeout) = {
            let st = self.shared.state.borrow();
            (st.wm_write, st.timeout_write)
        };

        if !self.shared.output.borrow().is_empty() {
            let result = self.shared.output.borrow_mut().write_fd(self.shared.fd);
            match result {
                Ok(0) => {
                    what |= BevFlags::EOF;
                    return self.report_error(what);
                }
                Err(e) if is_transient(&e) => {
                    if !self.shared.output.borrow().is_empty() {
                        self.schedule(self.shared.ev_write, timeout);
                    }
                    return;
                }
                Err(e) => {
                    ev_debug!("bufferevent on fd {}: write: {}", self.shared.fd, e);
                    what |= BevFlags::ERROR;
                    return self.report_error(what);
                }
                Ok(n) => ev_trace!("bufferevent on fd {}: wrote {} bytes", self.shared.fd, n),
            }
        }

        let len = self.shared.output.borrow().len();
        if len != 0 {
            self.schedule(self.shared.ev_write, timeout);
        }

        if len <= wm.low {
            self.invoke_write();
        }
    }

    fn invoke_read(&self) {
        let cb = self.shared.callbacks.borrow_mut().read.take();
        if let Some(mut cb) = cb {
            cb(self);
            let mut cbs = self.shared.callbacks.borrow_mut();
            if cbs.read.is_none() {
                cbs.read = Some(cb);
            }
        }
    }

    fn invoke_write(&self) {
        let cb = self.shared.callbacks.borrow_mut().write.take();
        if let Some(mut cb) = cb {
            cb(self);
            let mut cbs = self.shared.callbacks.borrow_mut();
            if cbs.write.is_none() {
                cbs.write = Some(cb);
            }
        }
    }

    fn report_error(&self, what: BevFlags) {
        ev_debug!("bufferevent on fd {}: {:?}", self.shared.fd, what);
        let cb = self.shared.callbacks.borrow_mut().error.take();
        if let Some(mut cb) = cb {
            cb(self, what);
            let mut cbs = self.shared.callbacks.borrow_mut();
            if cbs.error.is_none() {
                cbs.error = Some(cb);
            }
        }
    }
}

impl fmt::Debug for BufferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.borrow();
        f.debug_struct("BufferEvent")
            .field("fd", &self.shared.fd)
            .field("enabled", &st.enabled)
            .field("wm_read", &st.wm_read)
            .field("wm_write", &st.wm_write)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseConfig;
    use revent_core::LoopFlags;
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn base() -> Rc<EventBase> {
        Rc::new(EventBase::with_config(BaseConfig::new()).unwrap())
    }

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_write_drains_to_peer() {
        let base = base();
        let (a, mut b) = pair();
        let drained = Rc::new(Cell::new(0));

        let d = drained.clone();
        let bev = BufferEvent::new(
            &base,
            a.as_raw_fd(),
            None,
            Some(Box::new(move |bev: &BufferEvent| {
                assert!(bev.output().is_empty());
                d.set(d.get() + 1);
            })),
            None,
        )
        .unwrap();
        assert_eq!(bev.enabled(), Events::WRITE);

        bev.write(b"hello").unwrap();
        let mut other = Buffer::new();
        other.append(b" world").unwrap();
        bev.write_buffer(&mut other).unwrap();
        assert!(other.is_empty());

        base.run(LoopFlags::ONCE).unwrap();
        assert_eq!(drained.get(), 1);

        let mut got = [0u8; 32];
        let n = b.read(&mut got).unwrap();
        assert_eq!(&got[..n], b"hello world");

        // Nothing left to write: the loop has no more work
        assert_eq!(base.event_count(), 0);
    }

    #[test]
    fn test_read_then_eof() {
        let base = base();
        let (a, mut b) = pair();
        let reads = Rc::new(RefCell::new(Vec::new()));
        let errors = Rc::new(Cell::new(BevFlags::NONE));

        let r = reads.clone();
        let e = errors.clone();
        let bev = BufferEvent::new(
            &base,
            a.as_raw_fd(),
            Some(Box::new(move |bev: &BufferEvent| {
                let mut buf = [0u8; 64];
                let n = bev.read(&mut buf);
                r.borrow_mut().extend_from_slice(&buf[..n]);
            })),
            None,
            Some(Box::new(move |_: &BufferEvent, what: BevFlags| e.set(what))),
        )
        .unwrap();
        bev.enable(Events::READ).unwrap();
        assert!(bev.enabled().contains(Events::READ));

        b.write_all(b"ping").unwrap();
        base.run(LoopFlags::ONCE).unwrap();
        assert_eq!(*reads.borrow(), b"ping");

        drop(b);
        base.run(LoopFlags::ONCE).unwrap();
        assert_eq!(errors.get(), BevFlags::READ | BevFlags::EOF);
        assert_eq!(base.event_count(), 0);
    }

    #[test]
    fn test_high_watermark_pauses_reading() {
        let base = base();
        let (a, mut b) = pair();
        let reads = Rc::new(Cell::new(0));

        let r = reads.clone();
        let bev = BufferEvent::new(
            &base,
            a.as_raw_fd(),
            Some(Box::new(move |_: &BufferEvent| r.set(r.get() + 1))),
            None,
            None,
        )
        .unwrap();
        bev.set_watermark(Events::READ, 0, 4);
        bev.enable(Events::READ).unwrap();

        b.write_all(b"0123456789").unwrap();
        base.run(LoopFlags::NONBLOCK).unwrap();
        assert_eq!(bev.input().as_slice(), b"0123");
        assert_eq!(reads.get(), 1);

        // Paused: more loop passes read nothing
        for _ in 0..3 {
            base.run(LoopFlags::NONBLOCK).unwrap();
        }
        assert_eq!(bev.input().len(), 4);
        assert!(bev.input().has_callback());

        let mut two = [0u8; 2];
        assert_eq!(bev.read(&mut two), 2);
        assert!(!bev.input().has_callback());

        base.run(LoopFlags::NONBLOCK).unwrap();
        assert_eq!(bev.input().as_slice(), b"2345");
        assert_eq!(reads.get(), 2);
    }

    #[test]
    fn test_low_watermark_holds_read_callback() {
        let base = base();
        let (a, mut b) = pair();
        let reads = Rc::new(Cell::new(0));

        let r = reads.clone();
        let bev = BufferEvent::new(
            &base,
            a.as_raw_fd(),
            Some(Box::new(move |_: &BufferEvent| r.set(r.get() + 1))),
            None,
            None,
        )
        .unwrap();
        bev.set_watermark(Events::READ, 6, 0);
        assert_eq!(bev.watermark(Events::READ), Watermark { low: 6, high: 0 });
        bev.enable(Events::READ).unwrap();

        b.write_all(b"abc").unwrap();
        base.run(LoopFlags::NONBLOCK).unwrap();
        assert_eq!(reads.get(), 0);

        b.write_all(b"def").unwrap();
        base.run(LoopFlags::NONBLOCK).unwrap();
        assert_eq!(reads.get(), 1);
        assert_eq!(bev.input().as_slice(), b"abcdef");
    }

    #[test]
    fn test_read_timeout_reported() {
        let base = base();
        let (a, _b) = pair();
        let errors = Rc::new(Cell::new(BevFlags::NONE));

        let e = errors.clone();
        let bev = BufferEvent::new(
            &base,
            a.as_raw_fd(),
            None,
            None,
            Some(Box::new(move |_: &BufferEvent, what: BevFlags| e.set(what))),
        )
        .unwrap();
        bev.set_timeouts(Some(Duration::from_millis(20)), None).unwrap();
        bev.enable(Events::READ).unwrap();

        base.dispatch().unwrap();
        assert_eq!(errors.get(), BevFlags::READ | BevFlags::TIMEOUT);
    }

    #[test]
    fn test_disable_and_drop_release_watchers() {
        let base = base();
        let (a, _b) = pair();
        let bev = BufferEvent::new(&base, a.as_raw_fd(), None, None, None).unwrap();

        bev.enable(Events::READ).unwrap();
        assert_eq!(base.event_count(), 1);
        bev.disable(Events::READ).unwrap();
        assert_eq!(base.event_count(), 0);
        assert!(!bev.enabled().contains(Events::READ));

        bev.enable(Events::READ).unwrap();
        let copy = bev.clone();
        drop(bev);
        assert_eq!(base.event_count(), 1);
        drop(copy);
        assert_eq!(base.event_count(), 0);
    }

    #[test]
    fn test_echo_through_pair() {
        let base = base();
        let (a, mut b) = pair();
        let bev = BufferEvent::new(
            &base,
            a.as_raw_fd(),
            Some(Box::new(|bev: &BufferEvent| {
                let mut data = Buffer::new();
                bev.input().move_all_into(&mut data).unwrap();
                bev.write_buffer(&mut data).unwrap();
            })),
            None,
            None,
        )
        .unwrap();
        bev.enable(Events::READ).unwrap();

        b.write_all(b"echo me").unwrap();
        base.run(LoopFlags::ONCE).unwrap();
        base.run(LoopFlags::ONCE).unwrap();

        let mut got = [0u8; 16];
        let n = b.read(&mut got).unwrap();
        assert_eq!(&got[..n], b"echo me");
    }
}
