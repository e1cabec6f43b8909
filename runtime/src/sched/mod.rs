// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The M:N scheduler: one global FIFO run queue multiplexed over a fixed pool
//! of OS workers.
//!
//! Policy is deliberately the simple one: a single mutex guards the run
//! queue, hold times are O(1), and FIFO order is the only fairness mechanism.
//! Parking is two-phase (see [`ParkPhase`]) so a wake that races the context
//! save is never lost. The stop-the-world flag is checked at every scheduler
//! entry, which makes every task switch a collector safe point.

mod worker;

pub(crate) use worker::{Worker, try_current_worker};

use crate::task::stack::StackCache;
use crate::task::{ParkPhase, Task, TaskState, WaitReason, YIELD_WORD};
use crate::time::TimerHeap;
use crate::util::rtabort;
use crate::{config, sync, sys};
use cordyceps::List;
use core::ffi::c_void;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Once, OnceLock};

/// All live tasks. A plain vector of scheduler-owned pointers; wrapped so it
/// can live behind the scheduler mutex.
struct TaskRegistry(Vec<NonNull<Task>>);

// Safety: the registry owns its entries together with the scheduler; access
// is serialized by the enclosing mutex.
unsafe impl Send for TaskRegistry {}

pub(crate) struct Scheduler {
    /// The authoritative queue of runnable tasks.
    run_queue: sync::Mutex<List<Task>>,
    /// Every live task, for the collector's root scan and panic dumps.
    tasks: sync::Mutex<TaskRegistry>,
    workers: Box<[Worker]>,
    /// Workers currently in their idle path.
    idle: AtomicUsize,
    /// Live non-system tasks.
    live_user: AtomicUsize,
    /// Non-system tasks whose park completed.
    parked_user: AtomicUsize,
    /// Set while a collector owns the world.
    stop_world: AtomicBool,
    /// Workers post here when they reach their stop-the-world safe point.
    stopped: sync::Sema,
    pub(crate) timers: TimerHeap,
    stack_cache: StackCache,
}

static SCHED: OnceLock<Scheduler> = OnceLock::new();
static WORKERS_STARTED: Once = Once::new();

/// The scheduler singleton; first use boots the worker pool.
pub(crate) fn get() -> &'static Scheduler {
    let sched = SCHED.get_or_init(Scheduler::new);
    WORKERS_STARTED.call_once(|| sched.start_workers());
    sched
}

/// The task currently running on this OS thread, if any.
#[inline]
pub(crate) fn current_task() -> Option<NonNull<Task>> {
    try_current_worker().and_then(Worker::current)
}

impl Scheduler {
    fn new() -> Self {
        let nworkers = config::get().workers.max(1);
        let seed = sys::monotonic_now_ns() | 1;
        Self {
            run_queue: sync::Mutex::new(List::new()),
            tasks: sync::Mutex::new(TaskRegistry(Vec::new())),
            workers: (0..nworkers)
                .map(|id| {
                    let jitter = u64::try_from(id).expect("worker id fits in u64");
                    Worker::new(id, seed ^ (jitter << 32))
                })
                .collect(),
            idle: AtomicUsize::new(0),
            live_user: AtomicUsize::new(0),
            parked_user: AtomicUsize::new(0),
            stop_world: AtomicBool::new(false),
            stopped: sync::Sema::new(0),
            timers: TimerHeap::new(),
            stack_cache: StackCache::new(),
        }
    }

    fn start_workers(&'static self) {
        for worker in self.workers.iter() {
            let arg = core::ptr::from_ref(worker).cast_mut().cast::<c_void>();
            match sys::thread_spawn(worker::worker_thread_entry, arg) {
                Ok(_) => {}
                Err(err) => rtabort!("cannot start worker {}: {err}", worker.id),
            }
        }
        tracing::debug!(workers = self.workers.len(), "scheduler online");
    }

    pub(crate) fn workers(&self) -> &[Worker] {
        &self.workers
    }

    // --- spawning and reaping ---

    pub(crate) fn spawn_boxed(&'static self, entry: Box<dyn FnOnce() + Send>, system: bool) {
        let cfg = config::get();
        // Commit the whole window up front: ordinary Rust code does not carry
        // prologue checks, so growth-on-check only applies to stacks driven
        // through the stack_check/stack_grow contract.
        let stack = match self.stack_cache.take(cfg.stack_size, cfg.stack_size) {
            Ok(stack) => stack,
            Err(err) => rtabort!("cannot allocate task stack: {err}"),
        };
        let task = Task::new(entry, stack, system);

        self.tasks.lock().0.push(task);
        if !system {
            self.live_user.fetch_add(1, Ordering::SeqCst);
        }
        // Safety: just created
        let id = unsafe { task.as_ref() }.id;
        tracing::trace!(id, system, "task spawned");
        self.push_runnable(task, true);
    }

    pub(crate) fn reap(&self, task: NonNull<Task>) {
        // Safety: the task finished; only this worker still references it
        let t = unsafe { task.as_ref() };
        tracing::trace!(id = t.id, "task exited");
        t.set_state(TaskState::Dead);
        if let Some(stack) = t.take_stack() {
            self.stack_cache.put(stack);
        }
        self.tasks.lock().0.retain(|&p| p != task);
        if !t.system {
            self.live_user.fetch_sub(1, Ordering::SeqCst);
        }
        // Safety: unlinked from every scheduler structure above
        drop(unsafe { Box::from_raw(task.as_ptr()) });
    }

    // --- run queue ---

    pub(crate) fn push_runnable(&self, task: NonNull<Task>, wake: bool) {
        self.run_queue.lock().push_back(task);
        if wake {
            self.wake_one_idle();
        }
    }

    pub(crate) fn pop_runnable(&self) -> Option<NonNull<Task>> {
        self.run_queue.lock().pop_front()
    }

    fn wake_one_idle(&self) {
        for worker in self.workers.iter() {
            if worker.try_claim_parked() {
                worker.wake_note();
                return;
            }
        }
    }

    /// Wakes one idle worker so it re-arms against a newly registered timer.
    pub(crate) fn kick_idle(&self) {
        self.wake_one_idle();
    }

    // --- blocking and waking ---

    /// Moves a parked (or parking) task back to the runnable queue.
    ///
    /// Every parked task has exactly one unblocker — the channel peer that
    /// claimed it, its timer, or `close` — so finding the task in any other
    /// phase is a runtime bug.
    pub(crate) fn unblock(&self, task: NonNull<Task>) {
        // Safety: wakers only hold task pointers to live, parked tasks
        let t = unsafe { task.as_ref() };
        loop {
            let phase = t.park_word().load(Ordering::Acquire);
            if phase == ParkPhase::Parking as u8 {
                if t.park_word()
                    .compare_exchange(
                        ParkPhase::Parking as u8,
                        ParkPhase::Woken as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    // The parking worker observes Woken and requeues.
                    return;
                }
            } else if phase == ParkPhase::Parked as u8 {
                if t.park_word()
                    .compare_exchange(
                        ParkPhase::Parked as u8,
                        ParkPhase::Active as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    if !t.system {
                        self.parked_user.fetch_sub(1, Ordering::SeqCst);
                    }
                    t.set_state(TaskState::Runnable);
                    self.push_runnable(task, true);
                    return;
                }
            } else {
                rtabort!(
                    "unblock of task {} in phase {phase} (second unblocker?)",
                    t.id
                );
            }
        }
    }

    // --- stop the world ---

    #[inline]
    pub(crate) fn world_stopped(&self) -> bool {
        self.stop_world.load(Ordering::SeqCst)
    }

    /// Brings every worker (except the caller's, when called from a task) to
    /// its safe point and returns once they are all parked.
    pub(crate) fn stop_the_world(&self) {
        let was_stopped = self.stop_world.swap(true, Ordering::SeqCst);
        assert!(!was_stopped, "nested stop-the-world");

        // Kick idle workers out of their notes so they can acknowledge.
        for worker in self.workers.iter() {
            worker.wake_note();
        }

        let me = try_current_worker().map(|w| w.id);
        let expected = self.workers.len() - usize::from(me.is_some());
        for _ in 0..expected {
            self.stopped.wait();
        }
        tracing::trace!("world stopped");
    }

    pub(crate) fn start_the_world(&self) {
        self.stop_world.store(false, Ordering::SeqCst);
        for worker in self.workers.iter() {
            worker.wake_gc_note();
        }
        tracing::trace!("world restarted");
    }

    pub(crate) fn acknowledge_stop(&self) {
        self.stopped.post();
    }

    // --- introspection ---

    /// Runs `f` on every live task. The task registry lock is held throughout.
    pub(crate) fn for_each_task(&self, mut f: impl FnMut(&Task)) {
        let tasks = self.tasks.lock();
        for &task in tasks.0.iter() {
            // Safety: registry entries are live by construction
            f(unsafe { task.as_ref() });
        }
    }

    /// Writes the multi-task state dump that accompanies fatal errors.
    pub(crate) fn dump_tasks(&self) {
        self.for_each_task(|t| {
            let reason = t.wait_reason().as_str();
            if reason.is_empty() {
                eprintln!("task {} [{}]:", t.id, t.state().as_str());
            } else {
                eprintln!("task {} [{}, {}]:", t.id, t.state().as_str(), reason);
            }
        });
    }

    // --- idle accounting & deadlock detection ---

    pub(crate) fn note_idle(&self) -> usize {
        self.idle.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn note_active(&self) {
        self.idle.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn note_parked_task(&self, system: bool) {
        if !system {
            self.parked_user.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Called by the last worker going idle: if nothing can ever become
    /// runnable again while user tasks exist, the program is deadlocked.
    pub(crate) fn deadlock_check(&self) {
        if !self.run_queue.lock().is_empty() || self.timers.has_pending() {
            return;
        }
        let live = self.live_user.load(Ordering::SeqCst);
        let parked = self.parked_user.load(Ordering::SeqCst);
        if live > 0 && parked >= live {
            self.dump_tasks();
            rtabort!("all tasks are asleep - deadlock!");
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

// --- task-side entry points ---

/// Parks the current task.
///
/// The sequence is the runtime's core ordering contract: the park word goes to
/// `Parking` first, then `publish` runs (enqueueing the task on whatever it is
/// waiting for and releasing the resource lock), then the context is saved.
/// An unblocker can therefore never observe the task before it is claimable.
pub(crate) fn park(reason: WaitReason, publish: impl FnOnce()) {
    let Some(task) = current_task() else {
        rtabort!("park outside of a task");
    };
    // Safety: current_task pointers are live
    let t = unsafe { task.as_ref() };

    t.set_wait_reason(reason);
    t.park_word()
        .store(ParkPhase::Parking as u8, Ordering::Release);
    publish();

    // Safety: running on this task's stack, parent link maintained by the
    // worker that resumed us
    unsafe {
        weft_context::switch_out(crate::task::PARK_WORD, t.parent_link());
    }
    t.set_wait_reason(WaitReason::None);
}

/// Voluntarily yields the current task to the back of the run queue. Outside
/// a task this is an OS-level yield.
pub fn yield_now() {
    let Some(task) = current_task() else {
        std::thread::yield_now();
        return;
    };
    // Safety: current_task pointers are live
    let t = unsafe { task.as_ref() };
    // Safety: running on this task's stack
    unsafe {
        weft_context::switch_out(YIELD_WORD, t.parent_link());
    }
}

/// Spawns a task running `f`.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    get().spawn_boxed(Box::new(f), false);
}

/// Spawns a runtime-internal task, excluded from deadlock accounting.
pub(crate) fn spawn_system<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    get().spawn_boxed(Box::new(f), true);
}
