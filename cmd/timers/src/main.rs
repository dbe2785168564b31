//! Timer churn driver
//!
//! Arms a large set of timers with random sub-50ms timeouts. Every expiry
//! re-arms or cancels ten random timers until the callback budget is spent,
//! then the loop drains and exits on its own.
//!
//! Usage: `timers [NTIMERS]` (default 20000)
//!
//! # Environment Variables
//!
//! - `REVENT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `REVENT_NOMONOTONIC=1` - Run on the wall clock

use revent::{ev_info, EventBase, EventId, LoopFlags};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// xorshift64; deterministic across runs
struct Rng(Cell<u64>);

impl Rng {
    fn below(&self, n: u64) -> u64 {
        let mut x = self.0.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0.set(x);
        x % n
    }
}

fn main() -> revent::EventResult<()> {
    println!("=== revent Timer Churn ===\n");

    let ntimers: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(20_000);
    let budget = 10 * ntimers;

    let base = EventBase::new()?;
    let rng = Rc::new(Rng(Cell::new(0x2545_f491_4f6c_dd1d)));
    let ids: Rc<RefCell<Vec<EventId>>> = Rc::new(RefCell::new(Vec::with_capacity(ntimers)));
    let called = Rc::new(Cell::new(0usize));
    let (added, deleted) = (Rc::new(Cell::new(0usize)), Rc::new(Cell::new(0usize)));

    for _ in 0..ntimers {
        let (cb_rng, cb_ids, called) = (rng.clone(), ids.clone(), called.clone());
        let (added, deleted) = (added.clone(), deleted.clone());
        let id = base.timer_new(move |base, _, _, _| {
            let rng = &cb_rng;
            called.set(called.get() + 1);
            if called.get() >= budget {
                return;
            }
            let ids = cb_ids.borrow();
            for _ in 0..10 {
                let j = rng.below(ids.len() as u64) as usize;
                let us = rng.below(50_000);
                if us % 2 == 1 {
                    if base.event_add(ids[j], Some(Duration::from_micros(us))).is_ok() {
                        added.set(added.get() + 1);
                    }
                } else if base.event_del(ids[j]).is_ok() {
                    deleted.set(deleted.get() + 1);
                }
            }
        })?;
        base.event_add(id, Some(Duration::from_micros(rng.below(50_000))))?;
        ids.borrow_mut().push(id);
    }

    ev_info!("{} timers armed on {}", ntimers, base.method());

    let start = Instant::now();
    let exit = base.run(LoopFlags::NONE)?;
    let elapsed = start.elapsed();

    println!("=== Results ===");
    println!("Timers:     {}", ntimers);
    println!("Callbacks:  {}", called.get());
    println!("Re-armed:   {}", added.get());
    println!("Cancelled:  {}", deleted.get());
    println!("Elapsed:    {:?}", elapsed);
    println!("Exit code:  {}", exit.code());
    Ok(())
}
