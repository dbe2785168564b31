//! Persistent SIGINT watcher
//!
//! Press Ctrl-C three times. The third delivery deletes the watcher, which
//! leaves the loop with nothing registered and returns.
//!
//! # Environment Variables
//!
//! - `REVENT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `REVENT_SHOW_METHOD=1` - Print the backend in use

use revent::{ev_warn, EventBase, LoopFlags};
use std::cell::Cell;
use std::rc::Rc;

fn main() -> revent::EventResult<()> {
    println!("=== revent Signal Demo ===");
    println!("press Ctrl-C three times\n");

    let base = EventBase::new()?;
    let called = Rc::new(Cell::new(0u32));

    let c = called.clone();
    let sig = base.signal_new(libc::SIGINT, move |base, id, signo, _| {
        println!("signal_cb: got signal {}", signo);
        if c.get() >= 2 {
            if let Err(e) = base.event_del(id) {
                ev_warn!("event_del: {}", e);
            }
        }
        c.set(c.get() + 1);
    })?;
    base.event_add(sig, None)?;

    let exit = base.run(LoopFlags::NONE)?;
    println!("\ndone after {} signals (exit code {})", called.get(), exit.code());
    Ok(())
}
