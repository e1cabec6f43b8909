// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::heap::cache::HeapCache;
use crate::sync::Note;
use crate::task::{DONE_WORD, GC_WORD, PARK_WORD, ParkPhase, Task, TaskState, YIELD_WORD};
use crate::util::rtabort;
use crate::{sched, sys};
use core::cell::{Cell, UnsafeCell};
use core::ffi::c_void;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use weft_fastrand::FastRand;

std::thread_local! {
    static CURRENT_WORKER: Cell<*const Worker> = const { Cell::new(core::ptr::null()) };
}

/// The worker bound to the calling OS thread, if this thread is a worker.
#[inline]
pub(crate) fn try_current_worker() -> Option<&'static Worker> {
    let ptr = CURRENT_WORKER.with(Cell::get);
    // Safety: workers are stored in the 'static scheduler and never dropped
    unsafe { ptr.as_ref() }
}

/// One OS thread participating in scheduling.
pub(crate) struct Worker {
    pub(crate) id: usize,
    /// Idle parking spot.
    note: Note,
    /// Stop-the-world parking spot.
    gc_note: Note,
    /// True while this worker is in its idle path and targetable by
    /// [`Scheduler::wake_one_idle`](super::Scheduler).
    parked: AtomicBool,
    /// This worker's allocation cache; unsynchronized by design.
    cache: UnsafeCell<HeapCache>,
    /// Per-worker PRNG; seeds the select shuffle.
    rng: UnsafeCell<FastRand>,
    /// The task this worker is currently running.
    current: AtomicPtr<Task>,
}

// Safety: the atomic and Note fields synchronize themselves; `cache` and
// `rng` are only touched by the owning thread (or by the collector while the
// owner is parked at its safe point).
unsafe impl Sync for Worker {}

impl Worker {
    pub(crate) fn new(id: usize, seed: u64) -> Self {
        Self {
            id,
            note: Note::new(),
            gc_note: Note::new(),
            parked: AtomicBool::new(false),
            cache: UnsafeCell::new(HeapCache::new()),
            rng: UnsafeCell::new(FastRand::from_seed(seed)),
            current: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    #[inline]
    pub(crate) fn current(&self) -> Option<NonNull<Task>> {
        NonNull::new(self.current.load(Ordering::Acquire))
    }

    /// # Safety
    ///
    /// Only the owning worker thread may call this while the world runs; the
    /// collector may call it for parked workers during stop-the-world.
    #[expect(clippy::mut_from_ref, reason = "ownership protocol documented above")]
    pub(crate) unsafe fn cache_mut(&self) -> &mut HeapCache {
        // Safety: forwarded to the caller
        unsafe { &mut *self.cache.get() }
    }

    /// # Safety
    ///
    /// Only the owning worker thread may call this.
    #[expect(clippy::mut_from_ref, reason = "ownership protocol documented above")]
    pub(crate) unsafe fn rng_mut(&self) -> &mut FastRand {
        // Safety: forwarded to the caller
        unsafe { &mut *self.rng.get() }
    }

    pub(crate) fn wake_note(&self) {
        self.note.wake();
    }

    pub(crate) fn wake_gc_note(&self) {
        self.gc_note.wake();
    }

    /// Atomically claims this worker as a wake target if it is parked.
    pub(crate) fn try_claim_parked(&self) -> bool {
        self.parked.swap(false, Ordering::SeqCst)
    }

    /// The scheduling loop. Never returns; workers live for the process.
    fn run(&'static self, sched: &'static sched::Scheduler) {
        let _span = tracing::debug_span!("worker", id = self.id).entered();
        loop {
            if sched.world_stopped() {
                self.stop_for_collector();
                continue;
            }

            // Timer heap top is checked at every scheduler entry.
            sched.timers.try_turn(sched);

            match sched.pop_runnable() {
                Some(task) => self.run_task(sched, task),
                None => self.idle(sched),
            }
        }
    }

    /// Resumes one task and disposes of whatever it yields back.
    fn run_task(&self, sched: &'static sched::Scheduler, task: NonNull<Task>) {
        // Safety: runnable tasks popped from the queue are live
        let t = unsafe { task.as_ref() };
        debug_assert_eq!(t.state(), TaskState::Runnable);

        let Some(sp) = t.saved_sp() else {
            rtabort!("runnable task {} has no saved context", t.id);
        };
        t.record_sp(0);
        t.set_state(TaskState::Running);
        self.current.store(task.as_ptr(), Ordering::Release);

        // Safety: `sp` was produced by prepare_stack or a prior switch on
        // this task's stack, and the task is not running anywhere else
        let (word, next_sp) = unsafe { weft_context::switch_in(0, sp, t.stack_top()) };

        self.current
            .store(core::ptr::null_mut(), Ordering::Release);

        let Some(next_sp) = next_sp else {
            debug_assert_eq!(word, DONE_WORD);
            sched.reap(task);
            return;
        };
        t.record_sp(next_sp.get());

        match word {
            YIELD_WORD => {
                t.set_state(TaskState::Runnable);
                // Tail of the queue, no wake: this worker loops right back.
                sched.push_runnable(task, false);
            }
            PARK_WORD => self.finish_park(sched, task),
            GC_WORD => {
                // The task wanted a collection; with its context now saved,
                // run it here on the scheduler stack.
                t.set_state(TaskState::Runnable);
                sched.push_runnable(task, false);
                crate::gc::collect();
            }
            other => rtabort!("task {} yielded unknown word {other}", t.id),
        }
    }

    /// Second phase of parking, on the worker side: either commit the park or
    /// requeue a task that was woken mid-park.
    fn finish_park(&self, sched: &sched::Scheduler, task: NonNull<Task>) {
        // Safety: the task is suspended; we own its scheduling state
        let t = unsafe { task.as_ref() };
        t.set_state(TaskState::Waiting);

        match t.park_word().compare_exchange(
            ParkPhase::Parking as u8,
            ParkPhase::Parked as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => sched.note_parked_task(t.system),
            Err(phase) => {
                debug_assert_eq!(phase, ParkPhase::Woken as u8);
                t.park_word()
                    .store(ParkPhase::Active as u8, Ordering::Release);
                t.set_state(TaskState::Runnable);
                sched.push_runnable(task, false);
            }
        }
    }

    /// Parks on the idle note until there is (probably) work.
    fn idle(&self, sched: &'static sched::Scheduler) {
        self.note.clear();
        if sched.world_stopped() {
            return;
        }

        self.parked.store(true, Ordering::SeqCst);
        let n_idle = sched.note_idle();

        // Re-check under the parked flag: a spawner that pushed after our
        // pop saw `parked == true` and will wake the (sticky) note.
        if let Some(task) = sched.pop_runnable() {
            self.parked.store(false, Ordering::SeqCst);
            sched.note_active();
            self.run_task(sched, task);
            return;
        }

        if n_idle == sched.worker_count() {
            sched.deadlock_check();
        }

        match sched.timers.next_deadline() {
            Some(deadline) => {
                let now = sys::monotonic_now_ns();
                if deadline > now {
                    self.note.sleep_timeout(deadline - now);
                }
            }
            None => self.note.sleep(),
        }

        self.parked.store(false, Ordering::SeqCst);
        sched.note_active();
    }

    /// The stop-the-world safe point: flush nothing (the collector drains our
    /// cache), acknowledge, and sleep until the world restarts.
    fn stop_for_collector(&self) {
        let sched = sched::get();
        tracing::trace!(worker = self.id, "parking for collector");
        self.gc_note.clear();
        sched.acknowledge_stop();
        self.gc_note.sleep();
    }
}

/// OS entry point for worker threads.
pub(crate) extern "C" fn worker_thread_entry(arg: *mut c_void) -> *mut c_void {
    let worker = arg.cast::<Worker>();
    CURRENT_WORKER.with(|cell| cell.set(worker));
    // Safety: the scheduler passes a pointer into its 'static worker array
    let worker: &'static Worker = unsafe { &*worker };
    worker.run(sched::get());
    core::ptr::null_mut()
}
