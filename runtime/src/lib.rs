// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The weft language runtime core.
//!
//! An M:N scheduler multiplexing lightweight tasks over a fixed pool of OS
//! workers, typed channels with `select` as the primary synchronization
//! construct, a span-based allocator with a stop-the-world mark-sweep
//! collector, a finalizer registry, a defer/panic/recover chain, and timers —
//! all resting on a five-primitive OS portability layer.
//!
//! ```no_run
//! use weft_runtime as weft;
//! use weft::chan::Chan;
//!
//! let sum = weft::block_on(|| {
//!     let ch = Chan::new(0);
//!     for i in 1..=10_i64 {
//!         let tx = ch.clone();
//!         weft::spawn(move || tx.send(i));
//!     }
//!     (0..10).filter_map(|_| ch.recv()).sum::<i64>()
//! });
//! assert_eq!(sum, 55);
//! ```
//!
//! Tunables come from the environment: `WEFT_WORKERS`, `WEFT_GC_PERCENT`,
//! `WEFT_STACK_SIZE`, `WEFT_ARENA_SIZE`.

pub mod abi;
pub mod chan;
mod config;
mod error;
mod finalizer;
pub mod gc;
pub mod heap;
pub mod panicking;
mod sched;
pub(crate) mod sync;
pub(crate) mod sys;
pub mod task;
pub mod time;
mod util;

pub use config::Config;
pub use error::Error;
pub use finalizer::{remove_finalizer, set_finalizer};
pub use sched::{spawn, yield_now};

use std::sync::Arc;

/// Brings the scheduler and heap up without running anything. Implicit in
/// every other entry point; useful when startup cost should be paid early.
pub fn init() {
    config::get();
    heap::heap();
    sched::get();
}

/// Runs `f` as a task and blocks the calling OS thread until it finishes.
///
/// This is the bridge from non-runtime threads (`main`, tests) into the
/// scheduler; called from inside a task it simply runs `f` in place.
pub fn block_on<F, R>(f: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    init();

    if sched::current_task().is_some() {
        // Already on the scheduler; blocking the worker would be a deadlock.
        return f();
    }

    struct Join<R> {
        note: sync::Note,
        slot: sync::Mutex<Option<R>>,
    }

    let join = Arc::new(Join {
        note: sync::Note::new(),
        slot: sync::Mutex::new(None),
    });
    let inner = Arc::clone(&join);

    spawn(move || {
        let value = f();
        *inner.slot.lock() = Some(value);
        inner.note.wake();
    });

    join.note.sleep();
    let value = join.slot.lock().take();
    value.expect("joined task finished without storing a result")
}
