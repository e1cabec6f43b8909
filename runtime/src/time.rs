// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Timers: a single heap keyed by absolute monotonic wake time.
//!
//! Workers check the heap top at every scheduler entry and park with the
//! earliest deadline when idle. Expired entries either unblock a sleeping
//! task directly or run a small callback (the "dummy runnable" that feeds
//! timed channels).

use crate::chan::Chan;
use crate::task::{Task, WaitReason};
use crate::util::SendPtr;
use crate::{sched, sync, sys};
use core::cmp::Reverse;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BinaryHeap;
use std::time::Duration;

enum Action {
    /// Unblock a task parked in [`sleep`].
    Wake(SendPtr<Task>),
    /// Run a callback on whichever worker turns the heap.
    Call(Box<dyn FnOnce() + Send>),
}

struct Entry {
    when: u64,
    /// Tie-break so equal deadlines fire in registration order.
    seq: u64,
    action: Action,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.when, self.seq).cmp(&(other.when, other.seq))
    }
}

pub(crate) struct TimerHeap {
    heap: sync::Mutex<BinaryHeap<Reverse<Entry>>>,
    seq: AtomicU64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            heap: sync::Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn register(&self, when: u64, action: Action) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(Reverse(Entry { when, seq, action }));
    }

    /// Fires every due entry. Contended turns are skipped; another worker is
    /// already in here.
    pub(crate) fn try_turn(&self, sched: &sched::Scheduler) {
        let Some(mut heap) = self.heap.try_lock() else {
            return;
        };
        let now = sys::monotonic_now_ns();
        let mut due = Vec::new();
        loop {
            let expired = heap
                .peek()
                .is_some_and(|Reverse(top)| top.when <= now);
            if !expired {
                break;
            }
            let Some(Reverse(entry)) = heap.pop() else {
                break;
            };
            due.push(entry);
        }
        // Fire outside the heap lock: a callback may re-register a timer.
        drop(heap);
        for entry in due {
            tracing::trace!(when = entry.when, seq = entry.seq, "timer fired");
            match entry.action {
                Action::Wake(task) => {
                    // Safety: a sleeping task stays alive until its timer (its
                    // sole unblocker) has fired
                    let task = unsafe { NonNull::new_unchecked(task.get()) };
                    sched.unblock(task);
                }
                Action::Call(callback) => callback(),
            }
        }
    }

    /// Earliest pending deadline, for idle parking.
    pub(crate) fn next_deadline(&self) -> Option<u64> {
        self.heap.lock().peek().map(|Reverse(entry)| entry.when)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.heap.lock().is_empty()
    }
}

/// Parks the current task for at least `ns` nanoseconds. On a non-runtime
/// thread this is a plain OS sleep.
pub fn sleep_ns(ns: u64) {
    let sched = sched::get();
    let Some(task) = sched::current_task() else {
        sys::sleep_ns(ns);
        return;
    };

    let when = sys::monotonic_now_ns() + ns;
    sched::park(WaitReason::Sleep, || {
        sched.timers.register(when, Action::Wake(SendPtr(task.as_ptr())));
        sched.kick_idle();
    });
}

/// Parks the current task for the given duration.
pub fn sleep(d: Duration) {
    sleep_ns(duration_ns(d));
}

/// Returns a capacity-1 channel that receives one `()` after `d`.
///
/// Timed receive is select over this channel, mirroring the runtime's own
/// model of timeouts.
pub fn after(d: Duration) -> Chan<()> {
    let sched = sched::get();
    let ch = Chan::new(1);
    let tx = ch.clone();
    let when = sys::monotonic_now_ns() + duration_ns(d);
    sched.timers.register(
        when,
        Action::Call(Box::new(move || {
            // The buffer slot is reserved for this one send; a full buffer
            // means the receiver already gave up and dropped its end.
            let _ = tx.try_send(());
        })),
    );
    sched.kick_idle();
    ch
}

/// Monotonic nanoseconds since an arbitrary origin.
pub fn monotonic_now_ns() -> u64 {
    sys::monotonic_now_ns()
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_order_by_deadline_then_seq() {
        let heap = TimerHeap::new();
        heap.register(200, Action::Call(Box::new(|| {})));
        heap.register(100, Action::Call(Box::new(|| {})));
        heap.register(100, Action::Call(Box::new(|| {})));
        assert_eq!(heap.next_deadline(), Some(100));
        assert!(heap.has_pending());
    }
}
