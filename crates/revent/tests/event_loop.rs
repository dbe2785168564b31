//! End-to-end loop scenarios: timers, fd readiness and their interplay

use std::cell::RefCell;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use revent::{BaseConfig, Buffer, EventBase, EventError, Events, LoopExit, LoopFlags};

fn base() -> EventBase {
    EventBase::with_config(BaseConfig::new()).unwrap()
}

/// xorshift64*, enough for reproducible deadlines
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }
}

#[test]
fn random_timers_fire_once_in_deadline_order() {
    let base = base();
    let mut rng = Rng(0x9e37_79b9_7f4a_7c15);
    let fired: Rc<RefCell<Vec<(usize, u64)>>> = Rc::new(RefCell::new(Vec::new()));

    const N: usize = 64;
    for i in 0..N {
        let ms = rng.next() % 200;
        let fired = fired.clone();
        let id = base
            .timer_new(move |_, _, _, what| {
                assert_eq!(what, Events::TIMEOUT);
                fired.borrow_mut().push((i, ms));
            })
            .unwrap();
        base.event_add(id, Some(Duration::from_millis(ms))).unwrap();
    }

    let exit = base.run(LoopFlags::NONE).unwrap();
    assert_eq!(exit, LoopExit::Done);
    assert_eq!(exit.code(), 0);

    let fired = fired.borrow();
    assert_eq!(fired.len(), N);

    let mut seen = vec![false; N];
    for &(i, _) in fired.iter() {
        assert!(!seen[i], "timer {} fired twice", i);
        seen[i] = true;
    }
    for pair in fired.windows(2) {
        assert!(pair[0].1 <= pair[1].1, "{:?} fired before {:?}", pair[1], pair[0]);
    }
}

#[test]
fn read_with_timeout_sees_data_then_eof() {
    let base = base();
    let (a, mut b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();

    let results: Rc<RefCell<Vec<(Events, usize)>>> = Rc::new(RefCell::new(Vec::new()));
    let r = results.clone();
    let fd = a.as_raw_fd();
    let id = base
        .event_new(fd, Events::READ, move |base, id, fd, what| {
            let mut buf = Buffer::new();
            let n = if what.contains(Events::READ) {
                buf.read_fd(fd, None).unwrap()
            } else {
                0
            };
            r.borrow_mut().push((what, n));
            if n > 0 {
                base.event_add(id, Some(Duration::from_secs(5))).unwrap();
            }
        })
        .unwrap();
    base.event_add(id, Some(Duration::from_secs(5))).unwrap();

    b.write_all(b"0123456789").unwrap();
    b.shutdown(std::net::Shutdown::Write).unwrap();

    assert_eq!(base.dispatch().unwrap(), LoopExit::Done);
    assert_eq!(
        *results.borrow(),
        vec![(Events::READ, 10), (Events::READ, 0)]
    );
}

#[test]
fn expiry_disarms_persistent_reader() {
    let base = base();
    let (a, _b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();

    let hits = Rc::new(RefCell::new(Vec::new()));
    let h = hits.clone();
    let id = base
        .event_new(
            a.as_raw_fd(),
            Events::READ | Events::PERSIST,
            move |base, id, _, what| {
                h.borrow_mut().push(what);
                base.event_del(id).unwrap_err();
            },
        )
        .unwrap();
    base.event_add(id, Some(Duration::from_millis(10))).unwrap();

    // Expiry removes even a persistent watcher from fd interest
    assert_eq!(base.dispatch().unwrap(), LoopExit::Done);
    assert_eq!(*hits.borrow(), vec![Events::TIMEOUT]);
    assert_eq!(base.event_count(), 0);
}

#[test]
fn readable_and_timed_out_coalesce() {
    let base = base();
    let (a, mut b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();

    let hits = Rc::new(RefCell::new(Vec::new()));
    let h = hits.clone();
    let id = base
        .event_new(a.as_raw_fd(), Events::READ, move |_, _, _, what| {
            h.borrow_mut().push(what);
        })
        .unwrap();
    base.event_add(id, Some(Duration::ZERO)).unwrap();
    b.write_all(b"x").unwrap();

    base.run(LoopFlags::ONCE).unwrap();
    assert_eq!(*hits.borrow(), vec![Events::READ | Events::TIMEOUT]);
}

#[test]
fn write_and_read_watchers_share_a_descriptor() {
    let base = base();
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    let fd = a.as_raw_fd();

    let log = Rc::new(RefCell::new(Vec::new()));
    let l = log.clone();
    let reader = base
        .event_new(fd, Events::READ, move |_, _, _, _| l.borrow_mut().push("read"))
        .unwrap();
    let l = log.clone();
    let writer = base
        .event_new(fd, Events::WRITE, move |_, _, _, _| l.borrow_mut().push("write"))
        .unwrap();

    base.event_add(reader, None).unwrap();
    base.event_add(writer, None).unwrap();
    assert_eq!(base.event_count(), 2);

    // The socket is writable, not readable
    base.run(LoopFlags::ONCE).unwrap();
    assert_eq!(*log.borrow(), vec!["write"]);

    // Dropping write interest must leave read interest armed
    (&b).write_all(b"hi").unwrap();
    base.run(LoopFlags::ONCE).unwrap();
    assert_eq!(*log.borrow(), vec!["write", "read"]);
}

#[test]
fn nested_run_from_callback() {
    let base = base();
    let order = Rc::new(RefCell::new(Vec::new()));

    let o = order.clone();
    let inner = base
        .timer_new(move |_, _, _, _| o.borrow_mut().push("inner"))
        .unwrap();

    let o = order.clone();
    let outer = base
        .timer_new(move |base, _, _, _| {
            o.borrow_mut().push("outer-start");
            base.event_add(inner, Some(Duration::from_millis(5))).unwrap();
            base.run(LoopFlags::ONCE).unwrap();
            o.borrow_mut().push("outer-end");
        })
        .unwrap();
    base.event_add(outer, Some(Duration::ZERO)).unwrap();

    base.dispatch().unwrap();
    assert_eq!(*order.borrow(), vec!["outer-start", "inner", "outer-end"]);
}

#[test]
fn free_from_own_callback() {
    let base = base();
    let calls = Rc::new(RefCell::new(0));
    let c = calls.clone();
    let id = base
        .timer_new(move |base, id, _, _| {
            *c.borrow_mut() += 1;
            base.event_free(id).unwrap();
        })
        .unwrap();
    base.event_active(id, Events::TIMEOUT, 4).unwrap();
    base.run(LoopFlags::ONCE).unwrap();

    assert_eq!(*calls.borrow(), 1);
    assert_eq!(base.event_add(id, None), Err(EventError::InvalidEvent));
}

#[test]
fn once_on_descriptor() {
    let base = base();
    let (a, mut b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    let got = Rc::new(RefCell::new(None));

    let g = got.clone();
    base.once(a.as_raw_fd(), Events::READ, Some(Duration::from_secs(5)), move |_, fd, what| {
        *g.borrow_mut() = Some((fd, what));
    })
    .unwrap();
    b.write_all(b"!").unwrap();

    assert_eq!(base.dispatch().unwrap(), LoopExit::Done);
    assert_eq!(*got.borrow(), Some((a.as_raw_fd(), Events::READ)));
    assert_eq!(base.event_count(), 0);
}

#[test]
fn nonblock_returns_without_waiting() {
    let base = base();
    let id = base.timer_new(|_, _, _, _| panic!("must not fire")).unwrap();
    base.event_add(id, Some(Duration::from_secs(60))).unwrap();

    let start = std::time::Instant::now();
    assert_eq!(base.run(LoopFlags::NONBLOCK).unwrap(), LoopExit::Done);
    assert!(start.elapsed() < Duration::from_secs(1));
    base.event_del(id).unwrap();
}

#[test]
fn disabled_backend_fails_construction() {
    let err = EventBase::with_config(BaseConfig::new().no_epoll(true)).unwrap_err();
    assert_eq!(err, EventError::NoBackend);
}
