// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The stop-the-world mark-sweep collector.
//!
//! Collection always runs on a worker's scheduler stack, never on a task
//! stack: a task that wants a collection yields with a dedicated switch word,
//! so by the time marking starts *every* task — the requester included — has
//! its registers and live frames saved on its own stack, and the scan of
//! `saved_sp..stack_top` sees them all. Worker scheduler stacks never hold
//! managed pointers, which is an invariant of the runtime's internal code.
//!
//! Roots are: registered global regions, every task stack (conservative),
//! the buffered elements of every live channel, and — transitively — objects
//! resurrected by the finalizer pass. Objects carrying a type descriptor are
//! scanned precisely through its pointer map; `noscan` objects not at all;
//! the rest conservatively, word by word.

use crate::heap::{self, Heap};
use crate::util::rtabort;
use crate::{chan, finalizer, sched, sync, sys, task};
use std::sync::OnceLock;

/// Registered conservative root regions (start, bytes).
fn roots() -> &'static sync::Mutex<Vec<(usize, usize)>> {
    static ROOTS: OnceLock<sync::Mutex<Vec<(usize, usize)>>> = OnceLock::new();
    ROOTS.get_or_init(|| sync::Mutex::new(Vec::new()))
}

/// One collection at a time; also serializes explicit and triggered requests.
fn collector_lock() -> &'static sync::Mutex<()> {
    static LOCK: OnceLock<sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| sync::Mutex::new(()))
}

/// Declares `start..start+bytes` a root region: the collector scans it
/// conservatively at every collection. The region must be word-aligned and
/// must outlive its registration.
pub fn add_root_region(start: *const u8, bytes: usize) {
    assert_eq!(start as usize % size_of::<usize>(), 0, "unaligned root region");
    roots().lock().push((start as usize, bytes));
}

/// Removes a region previously registered with [`add_root_region`].
pub fn remove_root_region(start: *const u8) {
    roots().lock().retain(|&(s, _)| s != start as usize);
}

/// Runs a collection now and returns only after one that *started after this
/// call* has completed — concurrent collections in flight do not count, since
/// they may predate the caller's last heap mutation.
///
/// From a task this yields to the scheduler first so the task's context is
/// saved like everyone else's; from a non-runtime thread it collects in
/// place (such a thread must not hold the only reference to a managed
/// object, which the `block_on` pattern guarantees).
pub fn collect_now() {
    let heap = heap::heap();
    // Collections are serialized; one numbered past everything started so
    // far must have begun after we got here.
    let target = heap.gc_started() + 1;
    while heap.collections_completed() < target {
        request_collection();
    }
}

fn request_collection() {
    if let Some(current) = sched::current_task() {
        // Safety: running on the current task's stack; the worker interprets
        // GC_WORD by requeueing us and collecting on its own stack
        unsafe {
            weft_context::switch_out(task::GC_WORD, current.as_ref().parent_link());
        }
    } else {
        collect();
        std::thread::yield_now();
    }
}

/// The allocation-trigger entry: a single best-effort request; the retry
/// logic in the allocator provides the stronger guarantee where needed.
pub(crate) fn maybe_collect() {
    if sched::current_task().is_some() {
        request_collection();
    }
}

/// The actual collection. Runs on a scheduler stack or an external thread.
pub(crate) fn collect() {
    let heap = heap::heap();
    let sched = sched::get();

    // Someone else collecting satisfies our request too.
    let Some(_guard) = collector_lock().try_lock() else {
        return;
    };
    heap.note_gc_started();
    let _span = tracing::debug_span!("gc").entered();
    let started = sys::monotonic_now_ns();

    sched.stop_the_world();

    // Per-worker caches flow back to their spans before marking, so the
    // alloc bitmaps describe exactly the handed-out objects.
    {
        let mut pages = heap.pages.lock();
        for worker in sched.workers() {
            // Safety: every worker is parked at its safe point
            unsafe { worker.cache_mut() }.flush(&heap.map, &mut pages);
        }
    }

    let mut marker = Marker::new(heap);
    marker.scan_roots();
    marker.drain();
    finalizer::resurrect_unreachable(&mut marker);
    marker.drain();
    let marked_bytes = marker.marked_bytes;

    sweep(heap);
    heap.retarget(marked_bytes);
    finalizer::kick_runner();

    sched.start_the_world();
    tracing::debug!(
        live = marked_bytes,
        ns = sys::monotonic_now_ns() - started,
        "collection complete"
    );
}

pub(crate) struct Marker<'h> {
    heap: &'h Heap,
    /// Grey objects: marked, body not yet scanned.
    work: Vec<usize>,
    pub(crate) marked_bytes: usize,
}

impl<'h> Marker<'h> {
    fn new(heap: &'h Heap) -> Marker<'h> {
        Marker {
            heap,
            work: Vec::new(),
            marked_bytes: 0,
        }
    }

    /// Treats `addr` as a potential (possibly interior) pointer; marks the
    /// object it lands in and queues its body for scanning.
    pub(crate) fn mark_addr(&mut self, addr: usize) {
        let Some((span, slot)) = self.heap.find_slot(addr) else {
            return;
        };
        // Safety: spans referenced by the map are live
        let span = unsafe { span.as_ref() };
        if !span.is_allocated(slot) || !span.mark(slot) {
            return;
        }
        self.marked_bytes += span.elem_size();
        if !span.is_noscan(slot) {
            self.work.push(span.slot_addr(slot));
        }
    }

    /// Conservative word scan of `[start, end)`.
    fn scan_region(&mut self, start: usize, end: usize) {
        let word = size_of::<usize>();
        let mut addr = start.next_multiple_of(word);
        let end = end & !(word - 1);
        while addr < end {
            // Safety: callers only pass mapped regions (stacks, buffers,
            // registered roots)
            let candidate = unsafe { (addr as *const usize).read() };
            self.mark_addr(candidate);
            addr += word;
        }
    }

    fn scan_roots(&mut self) {
        // Global root regions.
        let regions: Vec<(usize, usize)> = roots().lock().clone();
        for (start, bytes) in regions {
            self.scan_region(start, start + bytes);
        }

        // Every task stack, live window only. The world is stopped, so every
        // non-dead task has a saved context.
        sched::get().for_each_task(|t| {
            if t.state() == task::TaskState::Dead {
                return;
            }
            let Some(sp) = t.saved_sp() else {
                rtabort!("task {} running during mark", t.id);
            };
            self.scan_region(sp.get(), t.stack_top().get());
        });

        // Buffered channel elements.
        chan::for_each_channel(|ch| {
            ch.scan_buffered(|addr, len| self.scan_region(addr, addr + len));
        });
    }

    /// Drains the grey set, scanning bodies precisely where a type
    /// descriptor exists and conservatively otherwise.
    pub(crate) fn drain(&mut self) {
        while let Some(base) = self.work.pop() {
            let Some((span, slot)) = self.heap.find_slot(base) else {
                rtabort!("grey object {base:#x} lost its span");
            };
            // Safety: spans referenced by the map are live
            let span = unsafe { span.as_ref() };
            let size = span.elem_size();

            match span.type_of(slot) {
                Some(ty) => {
                    let words = ty.size.min(size) / size_of::<usize>();
                    for word in 0..words {
                        if !ty.word_is_pointer(word) {
                            continue;
                        }
                        let addr = base + word * size_of::<usize>();
                        // Safety: inside a live, allocated object
                        let child = unsafe { (addr as *const usize).read() };
                        self.mark_addr(child);
                    }
                }
                None => self.scan_region(base, base + size),
            }
        }
    }
}

/// Sweeps every span: unmarked slots return to their free lists, empty spans
/// return their pages, and long-idle free pages go back to the OS.
fn sweep(heap: &Heap) {
    let mut pages = heap.pages.lock();
    pages.gc_epoch += 1;

    let mut index = 0;
    let mut freed_bytes = 0_usize;
    while index < pages.spans.len() {
        let span_ptr = pages.spans[index];
        // Safety: the spans list holds only live spans
        let span = unsafe { span_ptr.as_ref() };
        let outcome = span.sweep();
        freed_bytes += outcome.freed_bytes;

        if outcome.fully_free {
            let idle = span.idle_sweeps.fetch_add(1, core::sync::atomic::Ordering::Relaxed) + 1;
            // Completely idle spans give their pages back after a grace
            // cycle; a span that just emptied often refills immediately.
            if idle >= 2 {
                pages.spans.swap_remove(index);
                pages.free_span(&heap.map, span_ptr);
                continue;
            }
        } else {
            span.idle_sweeps.store(0, core::sync::atomic::Ordering::Relaxed);
        }
        if outcome.has_free {
            pages.note_nonfull(span_ptr);
        }
        index += 1;
    }

    pages.decommit_idle();
    tracing::trace!(freed = freed_bytes, "sweep complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_regions_register_and_unregister() {
        let region = [0_usize; 4];
        let ptr = region.as_ptr().cast::<u8>();
        add_root_region(ptr, size_of_val(&region));
        assert!(roots().lock().iter().any(|&(s, _)| s == ptr as usize));
        remove_root_region(ptr);
        assert!(!roots().lock().iter().any(|&(s, _)| s == ptr as usize));
    }
}
