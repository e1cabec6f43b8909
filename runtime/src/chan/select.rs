// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Multiway wait: choose exactly one of several channel operations.
//!
//! The algorithm is the classic one. Lock every involved channel in ascending
//! address order, poll the cases in a shuffled order (the shuffle is the
//! fairness mechanism), and execute the first ready case. Otherwise take the
//! default, or enroll a tentative waiter carrying a shared claim token on
//! every channel and park; the first operation to win the token CAS owns the
//! select, and the winner unlinks every other enrollment before returning.

use crate::chan::{
    Chan, ChanInner, RawChannel, SELECT_UNCLAIMED, SelectRef, Waiter, pop_claimable,
};
use crate::sched;
use crate::task::{Task, WaitReason};
use crate::util::rtabort;
use crate::{panicking, sync};
use core::mem::{ManuallyDrop, MaybeUninit};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use smallvec::SmallVec;

/// The result of a completed select: which case ran, and for receives
/// whether a value (rather than the closed indicator) arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectOutcome {
    pub index: usize,
    pub ok: bool,
}

/// Destination of a receive case. The slot is filled exactly when its case
/// is the chosen one; [`RecvSlot::take`] checks that for you.
pub struct RecvSlot<T> {
    value: MaybeUninit<T>,
    index: usize,
    taken: bool,
}

impl<T> RecvSlot<T> {
    pub fn new() -> RecvSlot<T> {
        RecvSlot {
            value: MaybeUninit::uninit(),
            index: usize::MAX,
            taken: false,
        }
    }

    /// Takes the received value if this slot's case won the given select
    /// with a real value.
    ///
    /// The outcome must come from the `wait` call this slot was enrolled in.
    pub fn take(&mut self, outcome: SelectOutcome) -> Option<T> {
        if self.taken || outcome.index != self.index || !outcome.ok {
            return None;
        }
        self.taken = true;
        // Safety: the winning receive case's slot was filled by the channel
        Some(unsafe { self.value.assume_init_read() })
    }
}

impl<T> Default for RecvSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of a send case. The value is consumed exactly when its case is the
/// chosen one; [`SendSlot::reclaim`] hands it back otherwise.
pub struct SendSlot<T> {
    value: ManuallyDrop<T>,
    index: usize,
    reclaimed: bool,
}

impl<T> SendSlot<T> {
    pub fn new(value: T) -> SendSlot<T> {
        SendSlot {
            value: ManuallyDrop::new(value),
            index: usize::MAX,
            reclaimed: false,
        }
    }

    /// Recovers the value if this slot's case did *not* win the select.
    ///
    /// The outcome must come from the `wait` call this slot was enrolled in.
    pub fn reclaim(&mut self, outcome: SelectOutcome) -> Option<T> {
        if self.reclaimed || outcome.index == self.index {
            return None;
        }
        self.reclaimed = true;
        // Safety: the value was not consumed by the channel and is taken
        // exactly once here
        Some(unsafe { ManuallyDrop::take(&mut self.value) })
    }
}

#[derive(Clone, Copy)]
enum Dir {
    Send(*const u8),
    Recv(*mut u8),
}

struct Case<'a> {
    chan: &'a RawChannel,
    dir: Dir,
}

/// A multiway wait under construction.
pub struct Select<'a> {
    cases: SmallVec<[Case<'a>; 4]>,
    has_default: bool,
}

impl<'a> Select<'a> {
    pub fn new() -> Select<'a> {
        Select {
            cases: SmallVec::new(),
            has_default: false,
        }
    }

    /// Adds a receive case; returns its case index.
    pub fn recv<T: Send>(&mut self, ch: &'a Chan<T>, slot: &'a mut RecvSlot<T>) -> usize {
        let index = self.cases.len();
        slot.index = index;
        slot.taken = false;
        self.cases.push(Case {
            chan: ch.raw(),
            dir: Dir::Recv(slot.value.as_mut_ptr().cast::<u8>()),
        });
        index
    }

    /// Adds a send case; returns its case index.
    pub fn send<T: Send>(&mut self, ch: &'a Chan<T>, slot: &'a mut SendSlot<T>) -> usize {
        let index = self.cases.len();
        slot.index = index;
        slot.reclaimed = false;
        self.cases.push(Case {
            chan: ch.raw(),
            dir: Dir::Send(core::ptr::from_ref::<T>(&slot.value).cast::<u8>()),
        });
        index
    }

    /// Adds a receive case over a raw channel; the ABI path.
    pub(crate) fn recv_raw(&mut self, chan: &'a RawChannel, dst: *mut u8) -> usize {
        let index = self.cases.len();
        self.cases.push(Case {
            chan,
            dir: Dir::Recv(dst),
        });
        index
    }

    /// Adds a send case over a raw channel; the ABI path.
    pub(crate) fn send_raw(&mut self, chan: &'a RawChannel, src: *const u8) -> usize {
        let index = self.cases.len();
        self.cases.push(Case {
            chan,
            dir: Dir::Send(src),
        });
        index
    }

    /// Makes the select non-blocking: `wait` returns `None` when no case is
    /// immediately ready.
    pub fn with_default(&mut self) {
        self.has_default = true;
    }

    /// Runs the select. Returns the chosen case, or `None` if the default
    /// was taken.
    pub fn wait(&mut self) -> Option<SelectOutcome> {
        let ncases = self.cases.len();
        assert!(ncases > 0, "select with no cases");
        let sched = sched::get();

        // Unique channels in ascending address order; locking in this order
        // makes concurrent selects deadlock-free.
        let mut chans: SmallVec<[&RawChannel; 4]> =
            self.cases.iter().map(|case| case.chan).collect();
        chans.sort_unstable_by_key(|ch| core::ptr::from_ref(*ch) as usize);
        chans.dedup_by(|a, b| core::ptr::eq(*a, *b));

        let mut guards: SmallVec<[sync::MutexGuard<'_, ChanInner>; 4]> =
            chans.iter().map(|ch| ch.inner.lock()).collect();
        let slot_of = |chan: &RawChannel| {
            chans
                .iter()
                .position(|c| core::ptr::eq(*c, chan))
                .expect("case channel not locked")
        };

        // Shuffled poll order: the fairness guarantee.
        let mut order: SmallVec<[usize; 8]> = (0..ncases).collect();
        if let Some(worker) = sched::try_current_worker() {
            // Safety: we are the owning worker thread
            unsafe { worker.rng_mut() }.shuffle(&mut order);
        }

        // Pass 1: execute the first ready case.
        for &index in order.iter() {
            let case = &self.cases[index];
            let gi = slot_of(case.chan);
            match case.dir {
                Dir::Recv(dst) => {
                    let ready = poll_recv(case.chan, &mut guards[gi], dst);
                    match ready {
                        Polled::Done { peer, ok } => {
                            drop(guards);
                            if let Some(peer) = peer {
                                sched.unblock(peer);
                            }
                            return Some(SelectOutcome { index, ok });
                        }
                        Polled::Blocked => {}
                    }
                }
                Dir::Send(src) => {
                    if guards[gi].closed {
                        drop(guards);
                        panicking::panic_any("send on closed channel");
                    }
                    match poll_send(case.chan, &mut guards[gi], src) {
                        Polled::Done { peer, ok } => {
                            drop(guards);
                            if let Some(peer) = peer {
                                sched.unblock(peer);
                            }
                            return Some(SelectOutcome { index, ok });
                        }
                        Polled::Blocked => {}
                    }
                }
            }
        }

        if self.has_default {
            return None;
        }

        // Pass 2: enroll on every case and park. The token is the atomic
        // arbiter; exactly one operation claims it.
        let Some(task) = sched::current_task() else {
            rtabort!("blocking select outside a task");
        };
        let token = AtomicUsize::new(SELECT_UNCLAIMED);
        let waiters = self.build_waiters(task, &token);

        for (index, case) in self.cases.iter().enumerate() {
            let gi = slot_of(case.chan);
            let inner = &mut *guards[gi];
            let node = NonNull::from(&waiters[index]);
            match case.dir {
                Dir::Send(_) => inner.sendq.push_back(node),
                Dir::Recv(_) => inner.recvq.push_back(node),
            }
            waiters[index].mark_queued();
        }
        sched::park(WaitReason::Select, move || drop(guards));

        // Pass 3: the winner unlinks every enrollment that is still queued,
        // so no channel is left holding a pointer into this dead frame.
        for ch in chans.iter() {
            let mut inner = ch.inner.lock();
            for (index, case) in self.cases.iter().enumerate() {
                if !core::ptr::eq(case.chan, *ch) || !waiters[index].is_queued() {
                    continue;
                }
                let node = NonNull::from(&waiters[index]);
                // Safety: the node is queued on exactly this channel's list,
                // witnessed by `queued` under this channel's mutex
                unsafe {
                    match case.dir {
                        Dir::Send(_) => inner.sendq.remove(node),
                        Dir::Recv(_) => inner.recvq.remove(node),
                    }
                };
                waiters[index].clear_queued();
            }
        }

        let index = token.load(Ordering::Acquire);
        assert!(index != SELECT_UNCLAIMED, "select woke without a winner");
        Some(SelectOutcome {
            index,
            ok: waiters[index].ok(),
        })
    }

    fn build_waiters(
        &self,
        task: NonNull<Task>,
        token: &AtomicUsize,
    ) -> SmallVec<[Waiter; 4]> {
        self.cases
            .iter()
            .enumerate()
            .map(|(index, case)| {
                let elem = match case.dir {
                    Dir::Send(src) => src.cast_mut(),
                    Dir::Recv(dst) => dst,
                };
                Waiter::new(
                    task,
                    elem,
                    Some(SelectRef {
                        token: NonNull::from(token),
                        index,
                    }),
                )
            })
            .collect()
    }
}

impl<'a> Default for Select<'a> {
    fn default() -> Self {
        Self::new()
    }
}

enum Polled {
    Done {
        peer: Option<NonNull<Task>>,
        ok: bool,
    },
    Blocked,
}

fn poll_recv(chan: &RawChannel, inner: &mut ChanInner, dst: *mut u8) -> Polled {
    if chan.capacity() == 0 {
        if let Some(waiter) = pop_claimable(&mut inner.sendq) {
            // Safety: claimed waiters are live until their task is unblocked
            let w = unsafe { waiter.as_ref() };
            // Safety: both slots hold elem_size bytes
            unsafe { core::ptr::copy_nonoverlapping(w.elem(), dst, chan.elem_size()) };
            return Polled::Done {
                peer: Some(w.task()),
                ok: true,
            };
        }
    } else if inner.len > 0 {
        chan.buffer_take(inner, dst);
        let peer = pop_claimable(&mut inner.sendq).map(|waiter| {
            // Safety: claimed waiters are live until their task is unblocked
            let w = unsafe { waiter.as_ref() };
            chan.buffer_put(inner, w.elem());
            w.task()
        });
        return Polled::Done { peer, ok: true };
    }

    if inner.closed {
        // Safety: dst accepts elem_size bytes
        unsafe { core::ptr::write_bytes(dst, 0, chan.elem_size()) };
        return Polled::Done {
            peer: None,
            ok: false,
        };
    }
    Polled::Blocked
}

fn poll_send(chan: &RawChannel, inner: &mut ChanInner, src: *const u8) -> Polled {
    if let Some(waiter) = pop_claimable(&mut inner.recvq) {
        // Safety: claimed waiters are live until their task is unblocked
        let w = unsafe { waiter.as_ref() };
        // Safety: both slots hold elem_size bytes
        unsafe { core::ptr::copy_nonoverlapping(src, w.elem(), chan.elem_size()) };
        w.set_ok(true);
        return Polled::Done {
            peer: Some(w.task()),
            ok: true,
        };
    }
    if inner.len < chan.capacity() {
        chan.buffer_put(inner, src);
        return Polled::Done { peer: None, ok: true };
    }
    Polled::Blocked
}
