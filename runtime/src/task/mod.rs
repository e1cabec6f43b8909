// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task: one logically-sequential activity with its own stack.

pub(crate) mod stack;

use crate::panicking::{DeferRecord, PanicRecord};
use crate::task::stack::TaskStack;
use cordyceps::{Linked, list};
use core::cell::{Cell, UnsafeCell};
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

/// Words a task passes out through a context switch.
pub(crate) const YIELD_WORD: usize = 0;
pub(crate) const PARK_WORD: usize = 1;
pub(crate) const DONE_WORD: usize = 2;
/// Yield requesting a collection: the worker requeues the task and collects
/// on its own (scheduler) stack.
pub(crate) const GC_WORD: usize = 3;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TaskState {
    Runnable = 0,
    Running = 1,
    Waiting = 2,
    Dead = 3,
}

impl TaskState {
    fn from_u8(raw: u8) -> TaskState {
        match raw {
            0 => TaskState::Runnable,
            1 => TaskState::Running,
            2 => TaskState::Waiting,
            _ => TaskState::Dead,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            TaskState::Runnable => "runnable",
            TaskState::Running => "running",
            TaskState::Waiting => "waiting",
            TaskState::Dead => "dead",
        }
    }
}

/// Two-phase parking word, the handshake that makes a wake racing the context
/// save impossible to lose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ParkPhase {
    /// Not parking.
    Active = 0,
    /// The task announced it will park but its context is not saved yet.
    Parking = 1,
    /// Context saved; an unblocker owns the transition back to runnable.
    Parked = 2,
    /// A wake arrived during `Parking`; the worker requeues instead of parking.
    Woken = 3,
}

/// Why a task is parked; surfaced in panic dumps and deadlock reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitReason {
    None = 0,
    ChanSend = 1,
    ChanRecv = 2,
    Select = 3,
    Sleep = 4,
    FinalizerWait = 5,
}

impl WaitReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            WaitReason::None => "",
            WaitReason::ChanSend => "chan send",
            WaitReason::ChanRecv => "chan receive",
            WaitReason::Select => "select",
            WaitReason::Sleep => "sleep",
            WaitReason::FinalizerWait => "finalizer wait",
        }
    }

    fn from_u8(raw: u8) -> WaitReason {
        match raw {
            1 => WaitReason::ChanSend,
            2 => WaitReason::ChanRecv,
            3 => WaitReason::Select,
            4 => WaitReason::Sleep,
            5 => WaitReason::FinalizerWait,
            _ => WaitReason::None,
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One task. Allocated on the native heap, owned by the scheduler, reclaimed
/// by the worker that observes its exit.
pub(crate) struct Task {
    /// Run queue membership. A runnable task is on exactly one run queue;
    /// waiting tasks are linked through channel/timer wait structures instead.
    run_links: list::Links<Task>,

    pub(crate) id: u64,
    /// System tasks (the finalizer runner) are invisible to deadlock
    /// accounting.
    pub(crate) system: bool,

    state: AtomicU8,
    park: AtomicU8,
    wait_reason: AtomicU8,

    /// The stack, present from spawn until the task dies and it is recycled.
    stack: UnsafeCell<Option<TaskStack>>,
    stack_top: NonZeroUsize,
    /// Saved stack pointer while suspended; 0 while running. The collector
    /// scans `saved_sp..stack_top` conservatively.
    saved_sp: AtomicUsize,

    /// The spawned closure, taken exactly once by the task entry.
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,

    // Owner-only state below: touched exclusively by the task itself while
    // running (the defer/panic machinery and frame bookkeeping).
    pub(crate) defers: UnsafeCell<Vec<DeferRecord>>,
    pub(crate) panic: UnsafeCell<Option<PanicRecord>>,
    pub(crate) frame_depth: Cell<u32>,
    pub(crate) in_defer: Cell<bool>,
}

// Safety: the atomic fields are safe to touch from any thread; the UnsafeCell
// and Cell fields follow an ownership protocol — they are accessed only by
// the task itself while it runs, or by the collector/reaper while the task
// provably cannot run (parked with saved context, or dead).
unsafe impl Send for Task {}
// Safety: see above.
unsafe impl Sync for Task {}

static_assertions::assert_impl_all!(Task: Send, Sync);

impl Task {
    /// Allocates a task around `entry` with the given stack; returns the
    /// scheduler-owned pointer.
    pub(crate) fn new(
        entry: Box<dyn FnOnce() + Send>,
        task_stack: TaskStack,
        system: bool,
    ) -> NonNull<Task> {
        let stack_top = task_stack.top();

        let task = Box::new(Task {
            run_links: list::Links::new(),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            system,
            state: AtomicU8::new(TaskState::Runnable as u8),
            park: AtomicU8::new(ParkPhase::Active as u8),
            wait_reason: AtomicU8::new(WaitReason::None as u8),
            stack: UnsafeCell::new(Some(task_stack)),
            stack_top,
            saved_sp: AtomicUsize::new(0),
            entry: UnsafeCell::new(Some(entry)),
            defers: UnsafeCell::new(Vec::new()),
            panic: UnsafeCell::new(None),
            frame_depth: Cell::new(0),
            in_defer: Cell::new(false),
        });
        let task = NonNull::from(Box::leak(task));

        // Safety: the stack is fresh and owned by this task; the payload (the
        // task pointer itself) is read exactly once by the entry trampoline
        let initial_sp = unsafe { weft_context::prepare_stack(stack_top, task_entry, task) };
        // Safety: just allocated above
        unsafe { task.as_ref() }
            .saved_sp
            .store(initial_sp.get(), Ordering::Release);

        task
    }

    #[inline]
    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn park_word(&self) -> &AtomicU8 {
        &self.park
    }

    #[inline]
    pub(crate) fn wait_reason(&self) -> WaitReason {
        WaitReason::from_u8(self.wait_reason.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_wait_reason(&self, reason: WaitReason) {
        self.wait_reason.store(reason as u8, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn stack_top(&self) -> NonZeroUsize {
        self.stack_top
    }

    /// Address of the parent-link word the switching protocol maintains near
    /// the stack top.
    #[inline]
    pub(crate) fn parent_link(&self) -> *mut weft_context::StackPointer {
        (self.stack_top.get() - 16) as *mut weft_context::StackPointer
    }

    #[inline]
    pub(crate) fn saved_sp(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.saved_sp.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn record_sp(&self, sp: usize) {
        self.saved_sp.store(sp, Ordering::Release);
    }

    /// The committed-window guard of this task's stack.
    pub(crate) fn stack_limit(&self) -> usize {
        // Safety: owner-only field, called from the task itself
        unsafe { (*self.stack.get()).as_ref() }.map_or(0, TaskStack::limit)
    }

    /// Grows this task's stack window; the compiled-code prologue contract.
    pub(crate) fn grow_stack(&self) -> bool {
        // Safety: owner-only field, called from the task itself
        unsafe { (*self.stack.get()).as_ref() }.is_some_and(TaskStack::grow)
    }

    /// Takes the stack for recycling once the task is dead.
    pub(crate) fn take_stack(&self) -> Option<TaskStack> {
        // Safety: only the reaping worker calls this, after the task died
        unsafe { (*self.stack.get()).take() }
    }

    /// Takes the entry closure; runs exactly once, on the task's own stack.
    fn take_entry(&self) -> Option<Box<dyn FnOnce() + Send>> {
        // Safety: owner-only field, called from the task entry
        unsafe { (*self.entry.get()).take() }
    }
}

// Safety: tasks are pinned for their whole life (Box::leak at spawn, freed by
// the reaper), and the run queue is the only list using these links.
unsafe impl Linked<list::Links<Task>> for Task {
    type Handle = NonNull<Task>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Task> {
        handle
    }

    unsafe fn from_ptr(ptr: NonNull<Task>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Task>) -> NonNull<list::Links<Task>> {
        // Safety: run_links is a field of a live Task
        unsafe { NonNull::new_unchecked(&raw mut (*ptr.as_ptr()).run_links) }
    }
}

/// Entry point of every task, running on the task stack.
unsafe extern "C" fn task_entry(
    _arg: usize,
    parent_link: &mut weft_context::StackPointer,
    payload: *mut NonNull<Task>,
) -> ! {
    // Safety: prepare_stack stored the task pointer as the payload
    let task = unsafe { payload.read() };
    // Safety: the task outlives its own execution
    let this = unsafe { task.as_ref() };

    // No entered span here: the task suspends and migrates between worker
    // threads, and an entered guard is thread-local state.
    let entry = this
        .take_entry()
        .unwrap_or_else(|| crate::util::rtabort!("task {} has no entry", this.id));
    crate::panicking::task_root(this, entry);

    // Safety: the parent link always points at the resuming worker
    unsafe { weft_context::switch_done(DONE_WORD, parent_link) }
}

/// Identifier of the current task, if called from one.
pub fn id() -> Option<u64> {
    // Safety: the pointer is valid while the task runs
    crate::sched::current_task().map(|t| unsafe { t.as_ref() }.id)
}

/// Ensures the current task has at least `headroom` bytes of committed stack
/// below the live stack pointer, growing the committed window if not.
///
/// This is the library rendering of the compiler's function-prologue check:
/// code generated against the runtime calls it on entry to any frame that
/// might outgrow the window.
pub fn stack_check(headroom: usize) {
    let Some(task) = crate::sched::current_task() else {
        return;
    };
    // Safety: the pointer is valid while the task runs
    let task = unsafe { task.as_ref() };

    let approx_sp = &raw const task as usize;
    while approx_sp.saturating_sub(headroom) < task.stack_limit() {
        if !task.grow_stack() {
            crate::util::rtabort!("task {}: stack overflow", task.id);
        }
    }
}
