//! TCP echo server on BufferEvent
//!
//! Every accepted connection gets a `BufferEvent` whose read callback moves
//! the whole input into the output. Connections are dropped on EOF, error
//! or after a minute of silence.
//!
//! Usage: `echo [ADDR]` (default 127.0.0.1:9000)
//!
//! # Environment Variables
//!
//! - `REVENT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `REVENT_PRIORITIES=N` - Priority bands; the listener takes band 0

use revent::{
    ev_debug, ev_info, ev_warn, BevFlags, Buffer, BufferEvent, EventBase, EventError, Events,
    LoopFlags,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Open connections, keyed by descriptor
type Conns = Rc<RefCell<HashMap<RawFd, (BufferEvent, TcpStream)>>>;

fn echo_read(bev: &BufferEvent) {
    let mut data = Buffer::new();
    if let Err(e) = bev.input().move_all_into(&mut data) {
        ev_warn!("fd {}: {}", bev.fd(), e);
        return;
    }
    if let Err(e) = bev.write_buffer(&mut data) {
        ev_warn!("fd {}: {}", bev.fd(), e);
    }
}

fn accept_one(base: &Rc<EventBase>, listener: &TcpListener, conns: &Conns) {
    let (stream, peer) = match listener.accept() {
        Ok(pair) => pair,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
        Err(e) => {
            ev_warn!("accept: {}", e);
            return;
        }
    };
    if let Err(e) = stream.set_nonblocking(true) {
        ev_warn!("{}: {}", peer, e);
        return;
    }

    let fd = stream.as_raw_fd();
    let closer = Rc::downgrade(conns);
    let bev = BufferEvent::new(
        base,
        fd,
        Some(Box::new(echo_read)),
        None,
        Some(Box::new(move |bev: &BufferEvent, what: BevFlags| {
            ev_debug!("fd {} closing: {:?}", bev.fd(), what);
            if let Some(conns) = closer.upgrade() {
                conns.borrow_mut().remove(&bev.fd());
            }
        })),
    );
    let bev = match bev {
        Ok(bev) => bev,
        Err(e) => {
            ev_warn!("{}: {}", peer, e);
            return;
        }
    };

    let armed = bev
        .set_timeouts(Some(IDLE_TIMEOUT), Some(IDLE_TIMEOUT))
        .and_then(|()| bev.enable(Events::READ));
    if let Err(e) = armed {
        ev_warn!("{}: {}", peer, e);
        return;
    }

    ev_info!("{} connected (fd {})", peer, fd);
    conns.borrow_mut().insert(fd, (bev, stream));
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== revent Echo Server ===\n");

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9000".to_string());

    let listener = TcpListener::bind(&addr)?;
    listener.set_nonblocking(true)?;

    let base = Rc::new(EventBase::new()?);
    let conns: Conns = Rc::new(RefCell::new(HashMap::new()));

    let lfd = listener.as_raw_fd();
    let accept = {
        let base_ref = Rc::downgrade(&base);
        let conns = conns.clone();
        base.event_new(lfd, Events::READ | Events::PERSIST, move |_, _, _, _| {
            if let Some(base) = base_ref.upgrade() {
                accept_one(&base, &listener, &conns);
            }
        })?
    };
    match base.event_priority_set(accept, 0) {
        Ok(()) | Err(EventError::InvalidPriority) => {}
        Err(e) => return Err(e.into()),
    }
    base.event_add(accept, None)?;

    println!("listening on {} using {}", addr, base.method());
    let exit = base.run(LoopFlags::NONE)?;
    println!("loop exited with code {}", exit.code());

    conns.borrow_mut().clear();
    Ok(())
}
