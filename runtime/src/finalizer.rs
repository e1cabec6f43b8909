// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The finalizer registry.
//!
//! A hash table from object address to cleanup callback. The keys are stored
//! as plain integers, invisible to the collector, so an entry alone never
//! keeps its object alive. After mark, the collector moves entries for
//! unreachable objects to a ready queue, resurrects the objects for exactly
//! one more cycle (their finalizer bit is cleared, so the next collection
//! reclaims them), and wakes the runner: a dedicated system task that drains
//! the queue and invokes each callback. A callback that panics unwinds the
//! runner's root and takes the process down, unless it recovers itself.

use crate::gc::Marker;
use crate::task::{Task, WaitReason};
use crate::util::{SendPtr, rtabort};
use crate::{heap, panicking, sched, sync};
use core::ptr::NonNull;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::{Once, OnceLock};

struct FinEntry {
    callback: Box<dyn FnMut(*mut u8) + Send>,
    /// Return-area size from the ABI contract; recorded for the call frame
    /// synthesized around the callback.
    ret_size: usize,
}

fn table() -> &'static sync::Mutex<HashMap<usize, FinEntry>> {
    static TABLE: OnceLock<sync::Mutex<HashMap<usize, FinEntry>>> = OnceLock::new();
    TABLE.get_or_init(|| sync::Mutex::new(HashMap::new()))
}

fn ready() -> &'static sync::Mutex<VecDeque<(usize, FinEntry)>> {
    static READY: OnceLock<sync::Mutex<VecDeque<(usize, FinEntry)>>> = OnceLock::new();
    READY.get_or_init(|| sync::Mutex::new(VecDeque::new()))
}

/// The runner task's parking spot: present exactly while it is parked.
fn parked_runner() -> &'static sync::Mutex<Option<SendPtr<Task>>> {
    static PARKED: OnceLock<sync::Mutex<Option<SendPtr<Task>>>> = OnceLock::new();
    PARKED.get_or_init(|| sync::Mutex::new(None))
}

/// Installs `callback` to run after the object at `obj` becomes unreachable.
///
/// `obj` must be the base pointer of a live managed allocation; anything else
/// is a fatal error, as is installing twice without removing first.
/// `ret_size` is the callback's ABI return-area size (zero for Rust callers).
pub fn set_finalizer(
    obj: *mut u8,
    callback: impl FnMut(*mut u8) + Send + 'static,
    ret_size: usize,
) {
    static RUNNER: Once = Once::new();
    RUNNER.call_once(|| sched::spawn_system(runner_main));

    let addr = obj as usize;
    let heap = heap::heap();
    let Some((span, slot)) = heap.find_slot(addr) else {
        rtabort!("finalizer on non-heap pointer {addr:#x}");
    };
    // Safety: spans referenced by the map are live
    let span = unsafe { span.as_ref() };
    if !span.is_allocated(slot) || span.slot_addr(slot) != addr {
        rtabort!("finalizer on non-heap pointer {addr:#x}");
    }

    let mut table = table().lock();
    if table.contains_key(&addr) {
        rtabort!("finalizer already installed for {addr:#x}");
    }
    span.set_finalizer_bit(slot);
    table.insert(
        addr,
        FinEntry {
            callback: Box::new(callback),
            ret_size,
        },
    );
    tracing::trace!(addr, "finalizer installed");
}

/// Removes the finalizer installed on `obj`, if any. Returns whether one
/// existed.
pub fn remove_finalizer(obj: *mut u8) -> bool {
    let addr = obj as usize;
    let removed = table().lock().remove(&addr).is_some();
    if removed {
        if let Some((span, slot)) = heap::heap().find_slot(addr) {
            // Safety: spans referenced by the map are live
            unsafe { span.as_ref() }.clear_finalizer_bit(slot);
        }
    }
    removed
}

/// The collector's post-mark pass: entries whose object is still unmarked
/// become finalizer work, and the object is resurrected for this cycle.
///
/// World is stopped; the caller drains the marker afterwards.
pub(crate) fn resurrect_unreachable(marker: &mut Marker<'_>) {
    let heap = heap::heap();
    let mut table = table().lock();

    let doomed: Vec<usize> = table
        .keys()
        .copied()
        .filter(|&addr| {
            heap.find_slot(addr).is_some_and(|(span, slot)| {
                // Safety: spans referenced by the map are live
                let span = unsafe { span.as_ref() };
                span.is_allocated(slot) && !span.is_marked(slot)
            })
        })
        .collect();

    if doomed.is_empty() {
        return;
    }

    let mut ready = ready().lock();
    for addr in doomed {
        let entry = table.remove(&addr).expect("doomed key vanished");
        let (span, slot) = heap.find_slot(addr).expect("doomed object has no span");
        // Safety: spans referenced by the map are live
        unsafe { span.as_ref() }.clear_finalizer_bit(slot);
        // One-cycle resurrection: the callback gets a live object.
        marker.mark_addr(addr);
        tracing::trace!(addr, "object queued for finalization");
        ready.push_back((addr, entry));
    }
}

/// Wakes the runner if finalizer work is pending. Called at the end of a
/// collection.
pub(crate) fn kick_runner() {
    if ready().lock().is_empty() {
        return;
    }
    if let Some(task) = parked_runner().lock().take() {
        // Safety: the runner parked itself and this is its sole unblocker
        let task = unsafe { NonNull::new_unchecked(task.get()) };
        sched::get().unblock(task);
    }
}

/// Body of the dedicated finalizer task.
fn runner_main() {
    loop {
        let job = ready().lock().pop_front();
        match job {
            Some((addr, mut entry)) => {
                tracing::trace!(addr, ret_size = entry.ret_size, "running finalizer");
                // Each callback runs in its own frame. A panic the callback
                // recovers unwinds that one invocation and the runner keeps
                // draining; an unrecovered panic still reaches the task root
                // and aborts the program.
                let _ = panicking::frame(|| (entry.callback)(addr as *mut u8));
            }
            None => {
                let task = sched::current_task().expect("runner is a task");
                sched::park(WaitReason::FinalizerWait, || {
                    *parked_runner().lock() = Some(SendPtr(task.as_ptr()));
                });
            }
        }
    }
}
