//! The event loop
//!
//! An `EventBase` owns every watcher registered with it (in a generational
//! arena), the readiness backend, the timer heap, one FIFO queue per
//! priority band and the signal bridge.
//!
//! # Watcher lifecycle
//!
//! ```text
//!  event_new ──► idle ──event_add──► INSERTED and/or TIMEOUT
//!                 ▲                      │ readiness / deadline / signal
//!                 │                      ▼
//!                 └────── callback ◄── ACTIVE (queued in its band)
//! ```
//!
//! Non-persistent watchers leave every structure before their callback
//! runs; persistent ones only leave the active queue. Timer expiry removes a
//! watcher from fd interest even when it is persistent.
//!
//! # Re-entrancy
//!
//! All methods take `&self`. State sits behind a `RefCell` that is never
//! borrowed while user code runs, so callbacks receive `&EventBase` and may
//! add, delete, activate, free or even run the loop again. A watcher's own
//! callback is moved out of its slot while it executes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::os::fd::RawFd;
use std::time::Duration;

use revent_core::{
    ev_debug, ev_msg, ev_trace, EventError, EventId, EventResult, Events, ListFlags, LoopFlags,
    MinHeap, Slab, Timestamp,
};

use crate::backend::{select_backend, Activation, Backend};
use crate::clock::Clock;
use crate::config::{defaults, BaseConfig};
use crate::signal::SignalBridge;

/// Watcher callback: `(base, id, fd or signal number, result flags)`
pub type Callback = Box<dyn FnMut(&EventBase, EventId, RawFd, Events)>;

/// How a `run` call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Terminated by `loopexit`/`loopbreak`, by the loop flags, or because
    /// every watcher was served and none re-armed
    Done,
    /// Nothing was registered when `run` was entered
    NoEvents,
}

impl LoopExit {
    /// Classic numeric code (0 done, 1 no events)
    pub fn code(self) -> i32 {
        match self {
            LoopExit::Done => 0,
            LoopExit::NoEvents => 1,
        }
    }
}

struct Watcher {
    /// Descriptor, or signal number for SIGNAL watchers
    fd: RawFd,
    events: Events,
    pri: usize,
    flags: ListFlags,
    res: Events,
    ncalls: u16,
    /// Absolute deadline while on the timer heap
    timeout: Option<Timestamp>,
    heap_idx: Option<usize>,
    callback: Option<Callback>,
    /// Freed by the loop after its callback returns (`once`)
    oneshot: bool,
    /// Activation that arrived while the callback was running further up
    /// the stack; replayed when that invocation returns
    missed: Option<(Events, u16)>,
}

impl Watcher {
    fn is_pending(&self) -> bool {
        self.flags
            .intersects(ListFlags::TIMEOUT | ListFlags::INSERTED | ListFlags::ACTIVE)
    }
}

/// The watcher whose callback is currently running
#[derive(Debug, Clone, Copy)]
struct Frame {
    id: EventId,
    cancelled: bool,
}

struct BaseState {
    backend: Box<dyn Backend>,
    clock: Clock,
    watchers: Slab<Watcher>,
    timeheap: MinHeap<EventId>,
    activequeues: Vec<VecDeque<EventId>>,
    /// Queue memberships of non-internal watchers
    event_count: usize,
    event_count_active: usize,
    event_gotterm: bool,
    event_break: bool,
    /// Time of the current iteration, cleared while blocked
    tv_cache: Option<Timestamp>,
    /// Last time observed before a dispatch (wall clock regression check)
    event_tv: Timestamp,
    signals: SignalBridge,
    /// Internal READ watcher on the signal bridge socket
    signal_watcher: Option<EventId>,
    frame: Option<Frame>,
    ready: Vec<Activation>,
}

fn heap_tracker(watchers: &mut Slab<Watcher>) -> impl FnMut(EventId, Option<usize>) + '_ {
    move |id, idx| {
        if let Some(w) = watchers.get_mut(id) {
            w.heap_idx = idx;
        }
    }
}

impl BaseState {
    fn gettime(&self) -> EventResult<Timestamp> {
        match self.tv_cache {
            Some(now) => Ok(now),
            None => self.clock.now(),
        }
    }

    fn nqueues(&self) -> usize {
        self.activequeues.len()
    }

    fn band(&self, pri: usize) -> usize {
        pri.min(self.nqueues() - 1)
    }

    fn watcher(&self, id: EventId) -> EventResult<&Watcher> {
        self.watchers.get(id).ok_or(EventError::InvalidEvent)
    }

    fn watcher_mut(&mut self, id: EventId) -> EventResult<&mut Watcher> {
        self.watchers.get_mut(id).ok_or(EventError::InvalidEvent)
    }

    fn queue_insert(&mut self, id: EventId, queue: ListFlags) {
        let band = match self.watchers.get(id) {
            Some(w) => self.band(w.pri),
            None => panic!("queue_insert: {:?} is not a live watcher", id),
        };
        let Some(w) = self.watchers.get_mut(id) else {
            unreachable!()
        };

        if w.flags.contains(queue) {
            // Double activation just merges results in event_active
            if queue == ListFlags::ACTIVE {
                return;
            }
            panic!("queue_insert: {:?} already on queue {:?}", id, queue);
        }

        if !w.flags.contains(ListFlags::INTERNAL) {
            self.event_count += 1;
        }
        w.flags.insert(queue);
        let deadline = w.timeout;

        match queue {
            ListFlags::INSERTED => {}
            ListFlags::ACTIVE => {
                self.event_count_active += 1;
                self.activequeues[band].push_back(id);
            }
            ListFlags::TIMEOUT => {
                let Some(deadline) = deadline else {
                    panic!("queue_insert: {:?} has no deadline", id);
                };
                self.timeheap
                    .push(deadline, id, &mut heap_tracker(&mut self.watchers));
            }
            other => panic!("queue_insert: unknown queue {:?}", other),
        }
    }

    fn queue_remove(&mut self, id: EventId, queue: ListFlags) {
        let band = match self.watchers.get(id) {
            Some(w) => self.band(w.pri),
            None => panic!("queue_remove: {:?} is not a live watcher", id),
        };
        let Some(w) = self.watchers.get_mut(id) else {
            unreachable!()
        };

        if !w.flags.contains(queue) {
            panic!("queue_remove: {:?} not on queue {:?}", id, queue);
        }

        if !w.flags.contains(ListFlags::INTERNAL) {
            self.event_count -= 1;
        }
        w.flags.remove(queue);
        let heap_idx = w.heap_idx;

        match queue {
            ListFlags::INSERTED => {}
            ListFlags::ACTIVE => {
                self.event_count_active -= 1;
                let q = &mut self.activequeues[band];
                if let Some(pos) = q.iter().position(|&x| x == id) {
                    q.remove(pos);
                }
            }
            ListFlags::TIMEOUT => {
                let Some(idx) = heap_idx else {
                    panic!("queue_remove: {:?} on TIMEOUT without heap index", id);
                };
                self.timeheap
                    .erase(idx, &mut heap_tracker(&mut self.watchers));
                if let Some(w) = self.watchers.get_mut(id) {
                    w.timeout = None;
                }
            }
            other => panic!("queue_remove: unknown queue {:?}", other),
        }
    }

    fn cancel_frame(&mut self, id: EventId) {
        if let Some(frame) = self.frame.as_mut() {
            if frame.id == id {
                frame.cancelled = true;
            }
        }
    }

    fn add(&mut self, id: EventId, timeout: Option<Duration>) -> EventResult<()> {
        let w = self.watcher(id)?;
        let (fd, events, flags, res) = (w.fd, w.events, w.flags, w.res);

        if timeout.is_some() && !flags.contains(ListFlags::TIMEOUT) {
            self.timeheap.reserve(1)?;
        }
        let deadline = match timeout {
            Some(tv) => Some(self.gettime()?.saturating_add(tv)),
            None => None,
        };

        ev_trace!(
            "event_add: {:?} fd {} {:?}{}",
            id,
            fd,
            events,
            if timeout.is_some() { " with timeout" } else { "" }
        );

        if events.intersects(Events::IO | Events::SIGNAL)
            && !flags.intersects(ListFlags::INSERTED | ListFlags::ACTIVE)
        {
            if events.contains(Events::SIGNAL) {
                self.signals.add(fd, id)?;
                if let Err(e) = self.ensure_signal_watcher() {
                    let _ = self.signals.del(fd, id);
                    return Err(e);
                }
            } else {
                self.backend.add(fd, id, events)?;
            }
            self.queue_insert(id, ListFlags::INSERTED);
        }

        if let Some(deadline) = deadline {
            if flags.contains(ListFlags::TIMEOUT) {
                self.queue_remove(id, ListFlags::TIMEOUT);
            }

            // Already queued because of an earlier expiry: that activation is
            // stale now, and so are any repeat calls still pending on it.
            if flags.contains(ListFlags::ACTIVE) && res.contains(Events::TIMEOUT) {
                self.cancel_frame(id);
                self.queue_remove(id, ListFlags::ACTIVE);
            }

            self.watcher_mut(id)?.timeout = Some(deadline);
            self.queue_insert(id, ListFlags::TIMEOUT);
        }
        Ok(())
    }

    /// Remove `id` from its structures; `keep_active` leaves the active
    /// queue alone (timer expiry re-activates right after)
    fn del(&mut self, id: EventId, keep_active: bool) -> EventResult<()> {
        let w = self.watcher(id)?;
        let (fd, events, flags) = (w.fd, w.events, w.flags);

        self.cancel_frame(id);
        self.watcher_mut(id)?.missed = None;

        if !flags.intersects(ListFlags::TIMEOUT | ListFlags::INSERTED | ListFlags::ACTIVE) {
            return Err(EventError::NotPending);
        }

        ev_trace!("event_del: {:?} fd {} {:?}", id, fd, events);

        if flags.contains(ListFlags::TIMEOUT) {
            self.queue_remove(id, ListFlags::TIMEOUT);
        }
        if flags.contains(ListFlags::ACTIVE) && !keep_active {
            self.queue_remove(id, ListFlags::ACTIVE);
        }
        if flags.contains(ListFlags::INSERTED) {
            self.queue_remove(id, ListFlags::INSERTED);
            if events.contains(Events::SIGNAL) {
                return self.signals.del(fd, id);
            }
            return self.backend.del(fd, id, events);
        }
        Ok(())
    }

    fn activate(&mut self, id: EventId, res: Events, ncalls: u16) -> EventResult<()> {
        let w = self.watcher_mut(id)?;
        if w.flags.contains(ListFlags::ACTIVE) {
            w.res |= res;
            return Ok(());
        }
        w.res = res;
        w.ncalls = ncalls;
        self.queue_insert(id, ListFlags::ACTIVE);
        Ok(())
    }

    fn ensure_signal_watcher(&mut self) -> EventResult<()> {
        if self.signal_watcher.is_some() {
            return Ok(());
        }

        let fd = self.signals.receiver_fd();
        let events = Events::READ | Events::PERSIST;
        let cb: Callback = Box::new(|base: &EventBase, _: EventId, _: RawFd, _: Events| {
            base.collect_signals();
        });
        let id = self.watchers.insert(Watcher {
            fd,
            events,
            pri: self.nqueues() / 2,
            flags: ListFlags::INIT | ListFlags::INTERNAL,
            res: Events::NONE,
            ncalls: 0,
            timeout: None,
            heap_idx: None,
            callback: Some(cb),
            oneshot: false,
            missed: None,
        })?;

        if let Err(e) = self.backend.add(fd, id, events) {
            self.watchers.remove(id);
            return Err(e);
        }
        self.queue_insert(id, ListFlags::INSERTED);
        self.signal_watcher = Some(id);
        ev_debug!("signal bridge watching fd {}", fd);
        Ok(())
    }

    /// Earliest deadline minus now; `None` blocks indefinitely
    fn timeout_next(&self) -> EventResult<Option<Duration>> {
        let Some(top) = self.timeheap.peek() else {
            return Ok(None);
        };
        let now = self.gettime()?;
        Ok(Some(top.deadline.saturating_sub(now)))
    }

    /// Shift every deadline back when the wall clock jumped backwards
    fn timeout_correct(&mut self) -> EventResult<()> {
        if self.clock.is_monotonic() {
            return Ok(());
        }

        let now = self.gettime()?;
        if now >= self.event_tv {
            self.event_tv = now;
            return Ok(());
        }

        let off = self.event_tv - now;
        ev_debug!("time is running backwards by {:?}, corrected", off);
        self.timeheap.shift_earlier(off);
        for (_, w) in self.watchers.iter_mut() {
            if let Some(t) = w.timeout.as_mut() {
                *t = t.saturating_sub(off);
            }
        }
        self.event_tv = now;
        Ok(())
    }

    fn timeout_process(&mut self) -> EventResult<()> {
        if self.timeheap.is_empty() {
            return Ok(());
        }
        let now = self.gettime()?;

        while let Some(top) = self.timeheap.peek() {
            if top.deadline > now {
                break;
            }
            let id = top.key;
            ev_trace!("timeout_process: {:?} expired", id);
            // fd interest goes too, even for persistent watchers
            let _ = self.del(id, true);
            self.activate(id, Events::TIMEOUT, 1)?;
        }
        Ok(())
    }

    /// Turn backend and signal reports into activations
    fn apply_ready(&mut self) {
        let mut ready = std::mem::take(&mut self.ready);
        for act in ready.drain(..) {
            let Some(w) = self.watchers.get(act.id) else {
                continue;
            };
            if act.events.contains(Events::SIGNAL) && !w.events.contains(Events::PERSIST) {
                let _ = self.del(act.id, false);
            }
            let _ = self.activate(act.id, act.events, act.ncalls);
        }
        self.ready = ready;
    }
}

/// Single-threaded readiness event loop
pub struct EventBase {
    state: RefCell<BaseState>,
    method: &'static str,
}

impl EventBase {
    /// Base configured from defaults and `REVENT_*` environment variables
    pub fn new() -> EventResult<Self> {
        Self::with_config(BaseConfig::from_env())
    }

    pub fn with_config(config: BaseConfig) -> EventResult<Self> {
        config.validate()?;

        let backend = select_backend(&config)?;
        let method = backend.name();
        let clock = Clock::detect(config.use_monotonic);
        let event_tv = clock.now()?;
        let signals = SignalBridge::new()?;

        let mut activequeues = Vec::new();
        activequeues.try_reserve_exact(config.num_priorities)?;
        activequeues.resize_with(config.num_priorities, VecDeque::new);

        if config.show_method {
            ev_msg!("revent using: {}", method);
        }
        ev_debug!(
            "base created: method {}, {} priorities, {:?} clock",
            method,
            config.num_priorities,
            clock.kind()
        );

        Ok(Self {
            state: RefCell::new(BaseState {
                backend,
                clock,
                watchers: Slab::new(),
                timeheap: MinHeap::new(),
                activequeues,
                event_count: 0,
                event_count_active: 0,
                event_gotterm: false,
                event_break: false,
                tv_cache: None,
                event_tv,
                signals,
                signal_watcher: None,
                frame: None,
                ready: Vec::new(),
            }),
            method,
        })
    }

    /// Backend name, e.g. `"epoll"`
    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn is_monotonic(&self) -> bool {
        self.state.borrow().clock.is_monotonic()
    }

    /// Number of priority bands
    pub fn priorities(&self) -> usize {
        self.state.borrow().nqueues()
    }

    /// Queue memberships of non-internal watchers
    pub fn event_count(&self) -> usize {
        self.state.borrow().event_count
    }

    pub fn event_count_active(&self) -> usize {
        self.state.borrow().event_count_active
    }

    /// Loop time: cached during an iteration, read fresh otherwise
    pub fn now(&self) -> EventResult<Timestamp> {
        self.state.borrow().gettime()
    }

    /// Replace the priority bands with `n` empty ones
    ///
    /// Refused with `ActiveEvents` while anything is queued for dispatch.
    pub fn priority_init(&self, n: usize) -> EventResult<()> {
        let mut st = self.state.borrow_mut();
        if st.event_count_active > 0 {
            return Err(EventError::ActiveEvents);
        }
        if n == 0 || n > defaults::MAX_PRIORITIES {
            return Err(EventError::InvalidPriority);
        }
        let mut queues = Vec::new();
        queues.try_reserve_exact(n)?;
        queues.resize_with(n, VecDeque::new);
        st.activequeues = queues;
        Ok(())
    }

    /// Create an idle watcher for `fd` with interest `events`
    ///
    /// Priority starts at the middle band. The watcher stays allocated until
    /// `event_free`.
    pub fn event_new<F>(&self, fd: RawFd, events: Events, cb: F) -> EventResult<EventId>
    where
        F: FnMut(&EventBase, EventId, RawFd, Events) + 'static,
    {
        self.insert_watcher(fd, events, Box::new(cb), false)
    }

    /// Watcher with no descriptor; only fires through its timeout or `event_active`
    pub fn timer_new<F>(&self, cb: F) -> EventResult<EventId>
    where
        F: FnMut(&EventBase, EventId, RawFd, Events) + 'static,
    {
        self.event_new(-1, Events::NONE, cb)
    }

    /// Persistent watcher for signal `signo`
    pub fn signal_new<F>(&self, signo: i32, cb: F) -> EventResult<EventId>
    where
        F: FnMut(&EventBase, EventId, RawFd, Events) + 'static,
    {
        self.event_new(signo, Events::SIGNAL | Events::PERSIST, cb)
    }

    fn insert_watcher(
        &self,
        fd: RawFd,
        events: Events,
        cb: Callback,
        oneshot: bool,
    ) -> EventResult<EventId> {
        let mut st = self.state.borrow_mut();
        let pri = st.nqueues() / 2;
        st.watchers.insert(Watcher {
            fd,
            events,
            pri,
            flags: ListFlags::INIT,
            res: Events::NONE,
            ncalls: 0,
            timeout: None,
            heap_idx: None,
            callback: Some(cb),
            oneshot,
            missed: None,
        })
    }

    /// Re-target an idle watcher: new descriptor, interest and callback
    pub fn event_assign<F>(&self, id: EventId, fd: RawFd, events: Events, cb: F) -> EventResult<()>
    where
        F: FnMut(&EventBase, EventId, RawFd, Events) + 'static,
    {
        let mut st = self.state.borrow_mut();
        let pri = st.nqueues() / 2;
        let w = st.watcher_mut(id)?;
        if w.is_pending() {
            return Err(EventError::ActiveEvents);
        }
        w.fd = fd;
        w.events = events;
        w.pri = pri;
        w.res = Events::NONE;
        w.ncalls = 0;
        w.missed = None;
        w.callback = Some(Box::new(cb));
        Ok(())
    }

    /// Delete if pending and release the slot; `id` goes stale
    pub fn event_free(&self, id: EventId) -> EventResult<()> {
        let mut st = self.state.borrow_mut();
        match st.del(id, false) {
            Ok(()) | Err(EventError::NotPending) => {}
            Err(e) => return Err(e),
        }
        st.watchers.remove(id);
        Ok(())
    }

    /// Move an idle watcher to band `pri` (0 runs first)
    pub fn event_priority_set(&self, id: EventId, pri: usize) -> EventResult<()> {
        let mut st = self.state.borrow_mut();
        let nqueues = st.nqueues();
        let w = st.watcher_mut(id)?;
        if w.flags.contains(ListFlags::ACTIVE) {
            return Err(EventError::ActiveEvents);
        }
        if pri >= nqueues {
            return Err(EventError::InvalidPriority);
        }
        w.pri = pri;
        Ok(())
    }

    /// Register `id`; with a timeout it also fires after that long
    ///
    /// All-or-nothing: on error the watcher's registration is unchanged.
    /// Adding a watcher that already has a deadline replaces the deadline.
    pub fn event_add(&self, id: EventId, timeout: Option<Duration>) -> EventResult<()> {
        self.state.borrow_mut().add(id, timeout)
    }

    /// Unregister `id` from fd interest, timers and the active queue
    ///
    /// Stops repeat invocations if called from the watcher's own callback.
    /// Returns `NotPending` for an idle watcher.
    pub fn event_del(&self, id: EventId) -> EventResult<()> {
        self.state.borrow_mut().del(id, false)
    }

    /// Queue `id` for dispatch with result `res`, `ncalls` times
    ///
    /// A watcher that is already active only gains the new result bits.
    pub fn event_active(&self, id: EventId, res: Events, ncalls: u16) -> EventResult<()> {
        self.state.borrow_mut().activate(id, res, ncalls)
    }

    /// Which of `events` are pending for `id`, plus the time left until its
    /// deadline when `TIMEOUT` is asked for and set
    pub fn event_pending(
        &self,
        id: EventId,
        events: Events,
    ) -> EventResult<(Events, Option<Duration>)> {
        let st = self.state.borrow();
        let w = st.watcher(id)?;

        let mut flags = Events::NONE;
        if w.flags.contains(ListFlags::INSERTED) {
            flags |= w.events & (Events::IO | Events::SIGNAL);
        }
        if w.flags.contains(ListFlags::ACTIVE) {
            flags |= w.res;
        }
        if w.flags.contains(ListFlags::TIMEOUT) {
            flags |= Events::TIMEOUT;
        }
        let mask = events & (Events::TIMEOUT | Events::IO | Events::SIGNAL);

        let remaining = match w.timeout {
            Some(deadline) if mask.contains(Events::TIMEOUT) => {
                Some(deadline.saturating_sub(st.gettime()?))
            }
            _ => None,
        };
        Ok((flags & mask, remaining))
    }

    /// Fire `cb` once, for readiness on `fd` or after `timeout`
    ///
    /// `events` may only hold `TIMEOUT`, `READ` and `WRITE`. A pure timer
    /// (`TIMEOUT` alone) defaults to an immediate timeout. The watcher frees
    /// itself after firing.
    pub fn once<F>(
        &self,
        fd: RawFd,
        events: Events,
        timeout: Option<Duration>,
        cb: F,
    ) -> EventResult<EventId>
    where
        F: FnOnce(&EventBase, RawFd, Events) + 'static,
    {
        if events.intersects(!(Events::TIMEOUT | Events::IO)) {
            return Err(EventError::InvalidEvent);
        }

        let (fd, interest, timeout) = if events == Events::TIMEOUT {
            (-1, Events::NONE, Some(timeout.unwrap_or(Duration::ZERO)))
        } else if events.intersects(Events::IO) {
            (fd, events & Events::IO, timeout)
        } else {
            return Err(EventError::InvalidEvent);
        };

        let mut cb = Some(cb);
        let wrapped: Callback = Box::new(move |base: &EventBase, _: EventId, fd: RawFd, ev: Events| {
            if let Some(cb) = cb.take() {
                cb(base, fd, ev);
            }
        });

        let id = self.insert_watcher(fd, interest, wrapped, true)?;
        if let Err(e) = self.event_add(id, timeout) {
            self.state.borrow_mut().watchers.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Stop the loop after `delay` (at the end of the current iteration when
    /// `None`)
    pub fn loopexit(&self, delay: Option<Duration>) -> EventResult<()> {
        self.once(-1, Events::TIMEOUT, delay, |base, _, _| {
            base.state.borrow_mut().event_gotterm = true;
        })
        .map(|_| ())
    }

    /// Stop the loop as soon as the running callback returns
    pub fn loopbreak(&self) {
        self.state.borrow_mut().event_break = true;
    }

    /// `run` without flags
    pub fn dispatch(&self) -> EventResult<LoopExit> {
        self.run(LoopFlags::NONE)
    }

    /// Run the loop
    ///
    /// Without flags, runs until `loopexit`/`loopbreak` or until no
    /// registered watchers remain. `ONCE` returns after the first batch of
    /// activations has been served; `NONBLOCK` polls instead of waiting.
    /// A backend failure ends the loop with `Err`.
    ///
    /// `run` may be called from inside a callback. A watcher whose callback
    /// is still running in an outer frame is not invoked by the nested loop;
    /// its activation is replayed once the outer invocation returns, unless
    /// the watcher was deleted in the meantime.
    pub fn run(&self, flags: LoopFlags) -> EventResult<LoopExit> {
        self.state.borrow_mut().tv_cache = None;
        let result = self.run_inner(flags);
        self.state.borrow_mut().tv_cache = None;
        result
    }

    fn run_inner(&self, flags: LoopFlags) -> EventResult<LoopExit> {
        let mut first = true;

        loop {
            {
                let mut st = self.state.borrow_mut();
                let st = &mut *st;

                if st.event_gotterm {
                    st.event_gotterm = false;
                    break;
                }
                if st.event_break {
                    st.event_break = false;
                    break;
                }

                st.timeout_correct()?;

                let timeout = if st.event_count_active > 0 || flags.contains(LoopFlags::NONBLOCK) {
                    Some(Duration::ZERO)
                } else {
                    st.timeout_next()?
                };

                if st.event_count == 0 {
                    ev_debug!("run: no events registered");
                    return Ok(if first { LoopExit::NoEvents } else { LoopExit::Done });
                }
                first = false;

                st.event_tv = st.gettime()?;
                st.tv_cache = None;

                let mut ready = std::mem::take(&mut st.ready);
                let dispatched = st.backend.dispatch(timeout, &mut ready);
                st.ready = ready;
                dispatched?;
                st.apply_ready();

                st.tv_cache = Some(st.clock.now()?);
                st.timeout_process()?;
            }

            let active = self.state.borrow().event_count_active;
            if active > 0 {
                self.process_active();
                if self.state.borrow().event_count_active == 0 && flags.contains(LoopFlags::ONCE) {
                    break;
                }
            } else if flags.contains(LoopFlags::NONBLOCK) {
                break;
            }
        }

        Ok(LoopExit::Done)
    }

    /// Serve every watcher queued in the highest non-empty band
    fn process_active(&self) {
        let band = {
            let st = self.state.borrow();
            match st.activequeues.iter().position(|q| !q.is_empty()) {
                Some(band) => band,
                None => return,
            }
        };

        loop {
            let (id, fd, res, ncalls, cb, prev_frame) = {
                let mut st = self.state.borrow_mut();
                let st = &mut *st;

                let Some(&id) = st.activequeues.get(band).and_then(|q| q.front()) else {
                    break;
                };

                let persist = match st.watchers.get(id) {
                    Some(w) => w.events.contains(Events::PERSIST),
                    None => {
                        st.activequeues[band].pop_front();
                        continue;
                    }
                };
                if persist {
                    st.queue_remove(id, ListFlags::ACTIVE);
                } else {
                    let _ = st.del(id, false);
                }

                let Some(w) = st.watchers.get_mut(id) else {
                    continue;
                };
                let (fd, res, ncalls) = (w.fd, w.res, w.ncalls);
                let cb = w.callback.take();
                let prev_frame = st.frame.replace(Frame { id, cancelled: false });
                (id, fd, res, ncalls, cb, prev_frame)
            };

            let Some(mut cb) = cb else {
                // Callback already running further up the stack
                ev_trace!("process_active: {:?} re-entered, deferred", id);
                let mut st = self.state.borrow_mut();
                st.frame = prev_frame;
                if let Some(w) = st.watchers.get_mut(id) {
                    w.missed = Some(match w.missed {
                        Some((r, n)) => (r | res, n),
                        None => (res, ncalls),
                    });
                }
                continue;
            };

            ev_trace!("process_active: {:?} res {:?} x{}", id, res, ncalls);

            let mut broke = false;
            let mut remaining = ncalls;
            while remaining > 0 {
                remaining -= 1;
                cb(self, id, fd, res);

                let st = self.state.borrow();
                if st.frame.map_or(false, |f| f.cancelled) {
                    break;
                }
                if st.event_break {
                    broke = true;
                    break;
                }
            }

            {
                let mut st = self.state.borrow_mut();
                st.frame = prev_frame;
                let mut missed = None;
                if let Some(w) = st.watchers.get_mut(id) {
                    if w.callback.is_none() {
                        w.callback = Some(cb);
                    }
                    missed = w.missed.take();
                }
                if let Some((res, ncalls)) = missed {
                    let _ = st.activate(id, res, ncalls);
                }
                if st.watchers.get(id).map_or(false, |w| w.oneshot && !w.is_pending()) {
                    st.watchers.remove(id);
                }
            }

            if broke {
                return;
            }
        }
    }

    /// Internal watcher callback: the bridge socket is readable, so signals
    /// were caught for this base
    fn collect_signals(&self) {
        let mut st = self.state.borrow_mut();
        let st = &mut *st;
        st.signals.drain();
        let mut ready = std::mem::take(&mut st.ready);
        st.signals.collect(&mut ready);
        st.ready = ready;
        st.apply_ready();
    }
}

impl fmt::Debug for EventBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("EventBase")
            .field("method", &self.method)
            .field("priorities", &st.nqueues())
            .field("watchers", &st.watchers.len())
            .field("event_count", &st.event_count)
            .field("event_count_active", &st.event_count_active)
            .field("timers", &st.timeheap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn base() -> EventBase {
        EventBase::with_config(BaseConfig::new()).unwrap()
    }

    fn base_with(priorities: usize) -> EventBase {
        EventBase::with_config(BaseConfig::new().num_priorities(priorities)).unwrap()
    }

    #[test]
    fn test_empty_base_returns_no_events() {
        let b = base();
        assert_eq!(b.method(), "epoll");
        assert_eq!(b.run(LoopFlags::NONE).unwrap(), LoopExit::NoEvents);
        assert_eq!(LoopExit::NoEvents.code(), 1);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let b = base();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (tag, ms) in [(3u32, 30u64), (1, 10), (2, 20)] {
            let order = order.clone();
            let id = b
                .timer_new(move |_, _, _, ev| {
                    assert_eq!(ev, Events::TIMEOUT);
                    order.borrow_mut().push(tag);
                })
                .unwrap();
            b.event_add(id, Some(Duration::from_millis(ms))).unwrap();
        }

        assert_eq!(b.event_count(), 3);
        assert_eq!(b.dispatch().unwrap(), LoopExit::Done);
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
        assert_eq!(b.event_count(), 0);
    }

    #[test]
    fn test_del_of_idle_watcher_is_not_pending() {
        let b = base();
        let id = b.timer_new(|_, _, _, _| {}).unwrap();
        assert_eq!(b.event_del(id), Err(EventError::NotPending));

        b.event_add(id, Some(Duration::from_secs(5))).unwrap();
        assert!(b.event_del(id).is_ok());
        assert_eq!(b.event_del(id), Err(EventError::NotPending));
    }

    #[test]
    fn test_stale_handle_rejected() {
        let b = base();
        let id = b.timer_new(|_, _, _, _| {}).unwrap();
        b.event_add(id, Some(Duration::from_secs(1))).unwrap();
        b.event_free(id).unwrap();

        assert_eq!(b.event_count(), 0);
        assert_eq!(b.event_add(id, None), Err(EventError::InvalidEvent));
        assert_eq!(b.event_free(id), Err(EventError::InvalidEvent));
    }

    #[test]
    fn test_del_inside_callback_stops_repeats() {
        let b = base();
        let calls = Rc::new(Cell::new(0));

        let c = calls.clone();
        let id = b
            .event_new(-1, Events::PERSIST, move |base, id, _, _| {
                c.set(c.get() + 1);
                let _ = base.event_del(id);
            })
            .unwrap();

        b.event_active(id, Events::TIMEOUT, 3).unwrap();
        b.run(LoopFlags::ONCE).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_ncalls_repeat_without_del() {
        let b = base();
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let id = b
            .timer_new(move |_, _, _, ev| {
                assert_eq!(ev, Events::SIGNAL);
                c.set(c.get() + 1);
            })
            .unwrap();

        b.event_active(id, Events::SIGNAL, 3).unwrap();
        b.event_active(id, Events::SIGNAL, 5).unwrap();
        assert_eq!(b.event_count_active(), 1);
        b.run(LoopFlags::ONCE).unwrap();
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_priority_bands_run_high_first() {
        let b = base_with(3);
        assert_eq!(b.priorities(), 3);
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut ids = Vec::new();
        for pri in [2usize, 0, 1] {
            let order = order.clone();
            let id = b
                .timer_new(move |_, _, _, _| order.borrow_mut().push(pri))
                .unwrap();
            b.event_priority_set(id, pri).unwrap();
            ids.push(id);
        }
        for &id in &ids {
            b.event_active(id, Events::TIMEOUT, 1).unwrap();
        }

        // One band per pass
        b.run(LoopFlags::NONBLOCK).unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_only_top_band_served_per_iteration() {
        let b = base_with(2);
        let hits = Rc::new(RefCell::new(Vec::new()));

        let h = hits.clone();
        let low = b.timer_new(move |_, _, _, _| h.borrow_mut().push("low")).unwrap();
        b.event_priority_set(low, 1).unwrap();
        let h = hits.clone();
        let high = b.timer_new(move |_, _, _, _| h.borrow_mut().push("high")).unwrap();
        b.event_priority_set(high, 0).unwrap();

        b.event_active(low, Events::TIMEOUT, 1).unwrap();
        b.event_active(high, Events::TIMEOUT, 1).unwrap();

        b.process_active();
        assert_eq!(*hits.borrow(), vec!["high"]);
        assert_eq!(b.event_count_active(), 1);
        b.process_active();
        assert_eq!(*hits.borrow(), vec!["high", "low"]);
    }

    #[test]
    fn test_priority_rules() {
        let b = base_with(2);
        let id = b.timer_new(|_, _, _, _| {}).unwrap();
        assert_eq!(b.event_priority_set(id, 2), Err(EventError::InvalidPriority));

        b.event_active(id, Events::TIMEOUT, 1).unwrap();
        assert_eq!(b.event_priority_set(id, 0), Err(EventError::ActiveEvents));
        assert_eq!(b.priority_init(4), Err(EventError::ActiveEvents));

        b.run(LoopFlags::NONBLOCK).unwrap();
        b.priority_init(4).unwrap();
        assert_eq!(b.priorities(), 4);
        assert_eq!(b.priority_init(0), Err(EventError::InvalidPriority));
    }

    #[test]
    fn test_readd_replaces_deadline() {
        let b = base();
        let id = b.timer_new(|_, _, _, _| {}).unwrap();
        b.event_add(id, Some(Duration::from_secs(60))).unwrap();
        b.event_add(id, Some(Duration::from_secs(1))).unwrap();

        assert_eq!(b.event_count(), 1);
        let (pending, left) = b.event_pending(id, Events::TIMEOUT | Events::READ).unwrap();
        assert_eq!(pending, Events::TIMEOUT);
        assert!(left.unwrap() <= Duration::from_secs(1));
    }

    #[test]
    fn test_add_after_timeout_fired_demotes_activation() {
        let b = base();
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let id = b.timer_new(move |_, _, _, _| c.set(c.get() + 1)).unwrap();

        {
            let mut st = b.state.borrow_mut();
            st.watcher_mut(id).unwrap().timeout = Some(Duration::ZERO);
            st.queue_insert(id, ListFlags::TIMEOUT);
            st.tv_cache = Some(Duration::from_secs(1));
            st.timeout_process().unwrap();
            st.tv_cache = None;
        }
        assert_eq!(b.event_count_active(), 1);

        // Re-arming cancels the queued expiry
        b.event_add(id, Some(Duration::from_secs(30))).unwrap();
        assert_eq!(b.event_count_active(), 0);
        b.run(LoopFlags::NONBLOCK).unwrap();
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_once_fires_once_and_frees() {
        let b = base();
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let id = b
            .once(-1, Events::TIMEOUT, None, move |_, fd, ev| {
                assert_eq!(fd, -1);
                assert_eq!(ev, Events::TIMEOUT);
                c.set(c.get() + 1);
            })
            .unwrap();

        assert_eq!(b.dispatch().unwrap(), LoopExit::Done);
        assert_eq!(calls.get(), 1);
        assert_eq!(b.event_pending(id, Events::TIMEOUT), Err(EventError::InvalidEvent));
        assert_eq!(b.state.borrow().watchers.len(), 0);

        assert_eq!(
            b.once(-1, Events::SIGNAL, None, |_, _, _| {}).err(),
            Some(EventError::InvalidEvent)
        );
    }

    #[test]
    fn test_loopexit_stops_persistent_loop() {
        let b = base();
        let ticks = Rc::new(Cell::new(0));
        let t = ticks.clone();
        let id = b
            .timer_new(move |base, id, _, _| {
                t.set(t.get() + 1);
                base.event_add(id, Some(Duration::from_millis(5))).unwrap();
            })
            .unwrap();
        b.event_add(id, Some(Duration::from_millis(5))).unwrap();
        b.loopexit(Some(Duration::from_millis(60))).unwrap();

        assert_eq!(b.dispatch().unwrap(), LoopExit::Done);
        assert!(ticks.get() >= 2);
        assert!(b.event_pending(id, Events::TIMEOUT).unwrap().0.contains(Events::TIMEOUT));
    }

    #[test]
    fn test_loopbreak_from_callback() {
        let b = base();
        let calls = Rc::new(Cell::new(0));
        let mut ids = Vec::new();
        for _ in 0..3 {
            let c = calls.clone();
            ids.push(
                b.timer_new(move |base, _, _, _| {
                    c.set(c.get() + 1);
                    base.loopbreak();
                })
                .unwrap(),
            );
        }
        for &id in &ids {
            b.event_active(id, Events::TIMEOUT, 1).unwrap();
        }

        assert_eq!(b.dispatch().unwrap(), LoopExit::Done);
        assert_eq!(calls.get(), 1);
        assert_eq!(b.event_count_active(), 2);
    }

    #[test]
    fn test_nested_run_replays_activation_of_running_watcher() {
        let b = base();
        let calls = Rc::new(Cell::new(0));

        let c = calls.clone();
        let id = b
            .event_new(-1, Events::PERSIST, move |base, id, _, _| {
                c.set(c.get() + 1);
                if c.get() == 1 {
                    base.event_active(id, Events::TIMEOUT, 1).unwrap();
                    base.run(LoopFlags::NONBLOCK).unwrap();
                    // Not invoked by the nested loop
                    assert_eq!(c.get(), 1);
                }
            })
            .unwrap();

        b.event_active(id, Events::TIMEOUT, 1).unwrap();
        b.run(LoopFlags::NONBLOCK).unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(b.event_count_active(), 0);
    }

    #[test]
    fn test_deferred_activation_dropped_by_del() {
        let b = base();
        let calls = Rc::new(Cell::new(0));

        let c = calls.clone();
        let id = b
            .event_new(-1, Events::PERSIST, move |base, id, _, _| {
                c.set(c.get() + 1);
                base.event_active(id, Events::TIMEOUT, 1).unwrap();
                base.run(LoopFlags::NONBLOCK).unwrap();
                let _ = base.event_del(id);
            })
            .unwrap();

        b.event_active(id, Events::TIMEOUT, 1).unwrap();
        b.run(LoopFlags::NONBLOCK).unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(b.event_count(), 0);
    }

    #[test]
    fn test_assign_requires_idle() {
        let b = base();
        let id = b.timer_new(|_, _, _, _| {}).unwrap();
        b.event_add(id, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(
            b.event_assign(id, -1, Events::NONE, |_, _, _, _| {}),
            Err(EventError::ActiveEvents)
        );
        b.event_del(id).unwrap();
        b.event_assign(id, 7, Events::READ, |_, _, _, _| {}).unwrap();
    }

    #[test]
    fn test_clock_regression_shifts_deadlines() {
        let b = EventBase::with_config(BaseConfig::new().use_monotonic(false)).unwrap();
        assert!(!b.is_monotonic());

        let id = b.timer_new(|_, _, _, _| {}).unwrap();
        b.event_add(id, Some(Duration::from_secs(100))).unwrap();
        let before = b.event_pending(id, Events::TIMEOUT).unwrap().1.unwrap();

        {
            let mut st = b.state.borrow_mut();
            // Pretend the previous iteration saw a clock 50s ahead of now
            st.event_tv = st.clock.now().unwrap() + Duration::from_secs(50);
            st.timeout_correct().unwrap();
        }

        let after = b.event_pending(id, Events::TIMEOUT).unwrap().1.unwrap();
        assert!(before - after >= Duration::from_secs(49));
        assert!(after > Duration::from_secs(45));

        let st = b.state.borrow();
        assert_eq!(st.timeheap.peek().map(|e| Some(e.deadline)), Some(st.watchers.get(id).unwrap().timeout));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = EventBase::with_config(BaseConfig::new().num_priorities(0)).unwrap_err();
        assert!(matches!(err, EventError::InvalidConfig(_)));
    }
}
