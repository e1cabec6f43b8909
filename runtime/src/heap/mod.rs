// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The managed-object allocator.
//!
//! Two levels: per-worker caches hand out small objects from class-local free
//! lists without any synchronization; the shared [`PageHeap`] behind one mutex
//! refills caches, serves large objects and owns the page bookkeeping the
//! collector sweeps over. Every pointer handed out here resolves back to its
//! span in O(1) through the [`SpanMap`].

pub(crate) mod cache;
pub(crate) mod classes;
pub(crate) mod pages;
pub(crate) mod span;

use crate::heap::cache::REFILL_BATCH;
use crate::heap::classes::SizeClasses;
use crate::heap::pages::{PageHeap, SpanMap};
use crate::heap::span::{CLASS_LARGE, Span};
use crate::util::rtabort;
use crate::{config, gc, sched};
use crate::{error::Error, sync};
use bitflags::bitflags;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Runtime page size: the granularity spans are carved at.
pub(crate) const PAGE_SIZE: usize = 8192;
pub(crate) const PAGE_SHIFT: usize = 13;

/// Collections are never triggered below this heap target.
const MIN_NEXT_GC: usize = 4 << 20;

bitflags! {
    /// Allocation behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// The object holds no managed pointers; the collector skips its body.
        const NO_POINTERS = 1 << 0;
        /// The caller initializes every byte; skip the guaranteed zeroing.
        const NO_ZERO = 1 << 1;
        /// Exclude the allocation from profiling samples.
        const NO_PROFILE = 1 << 2;
    }
}

/// The compiler-contract type descriptor: object size plus a bitmap with one
/// bit per word telling the collector which words hold managed pointers.
///
/// Descriptors are consumed, never produced, by the runtime; a compiler (or a
/// test) provides them with `'static` lifetime.
#[derive(Debug)]
pub struct TypeDesc {
    pub size: usize,
    /// Bit `i` set ⇒ word `i` of the object is a managed pointer.
    pub ptrmap: &'static [u8],
    pub name: &'static str,
}

impl TypeDesc {
    #[inline]
    pub(crate) fn word_is_pointer(&self, word: usize) -> bool {
        self.ptrmap
            .get(word / 8)
            .is_some_and(|byte| byte & (1 << (word % 8)) != 0)
    }
}

/// The panic payload for allocation failure after a forced collection.
#[derive(Debug, Clone, Copy)]
pub struct OutOfMemory;

impl core::fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("out of memory")
    }
}

/// Point-in-time allocator numbers, cheap enough for tests and the trigger.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    /// Bytes believed live (allocated since the last collection retarget).
    pub live_bytes: usize,
    /// Live spans.
    pub spans: usize,
    /// Completed collections.
    pub collections: u64,
    /// Heap size that triggers the next collection.
    pub next_gc: usize,
}

pub(crate) struct Heap {
    pub(crate) map: SpanMap,
    pub(crate) pages: sync::Mutex<PageHeap>,
    pub(crate) classes: SizeClasses,
    live_bytes: AtomicUsize,
    next_gc: AtomicUsize,
    /// Collections begun; at most one ahead of `collections`.
    gc_started: AtomicU64,
    /// Collections completed.
    collections: AtomicU64,
}

static HEAP: OnceLock<Heap> = OnceLock::new();

pub(crate) fn heap() -> &'static Heap {
    HEAP.get_or_init(|| {
        let arena_bytes = config::get().arena_size & !(PAGE_SIZE - 1);
        let arena = match crate::sys::page_reserve(arena_bytes) {
            Ok(base) => base,
            Err(err) => rtabort!("cannot reserve managed heap arena: {err}"),
        };
        tracing::debug!(
            base = arena.as_ptr() as usize,
            bytes = arena_bytes,
            "managed arena reserved"
        );
        Heap {
            map: SpanMap::new(arena, arena_bytes),
            pages: sync::Mutex::new(PageHeap::new(arena.as_ptr() as usize, arena_bytes)),
            classes: SizeClasses::generate(),
            live_bytes: AtomicUsize::new(0),
            next_gc: AtomicUsize::new(MIN_NEXT_GC),
            gc_started: AtomicU64::new(0),
            collections: AtomicU64::new(0),
        }
    })
}

impl Heap {
    /// Allocates a managed object, collecting first if the heap has grown past
    /// its target and once more (forced) if the arena is exhausted.
    ///
    /// Panics the current task with [`OutOfMemory`] when even a forced
    /// collection cannot make room.
    pub(crate) fn allocate(
        &self,
        size: usize,
        flags: AllocFlags,
        ty: Option<&'static TypeDesc>,
    ) -> NonNull<u8> {
        let size = ty.map_or(size, |ty| ty.size).max(1);

        if self.live_bytes.load(Ordering::Relaxed) >= self.next_gc.load(Ordering::Relaxed) {
            gc::maybe_collect();
        }

        let ptr = match self.try_allocate_raw(size) {
            Ok(ptr) => ptr,
            Err(_) => {
                // The scheduler retries exactly once behind a forced
                // collection before declaring the program out of memory.
                gc::collect_now();
                match self.try_allocate_raw(size) {
                    Ok(ptr) => ptr,
                    Err(err) => {
                        tracing::error!("allocation of {size} bytes failed: {err}");
                        crate::panicking::panic_any(OutOfMemory)
                    }
                }
            }
        };

        let addr = ptr.as_ptr() as usize;
        let Some((span, slot)) = self.find_slot(addr) else {
            rtabort!("fresh allocation {addr:#x} has no span");
        };
        // Safety: spans stay alive while any of their objects do
        let span = unsafe { span.as_ref() };
        span.set_allocated(slot);
        if flags.contains(AllocFlags::NO_POINTERS) {
            span.set_noscan(slot);
        }
        if let Some(ty) = ty {
            span.set_type(slot, ty);
        }
        if !flags.contains(AllocFlags::NO_ZERO) {
            // Zero the whole slot: the tail past `size` must not keep stale
            // values a conservative scan could mistake for pointers.
            // Safety: the slot is exclusively ours and elem_size bytes long
            unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, span.elem_size()) };
        }
        self.live_bytes.fetch_add(span.elem_size(), Ordering::Relaxed);
        ptr
    }

    fn try_allocate_raw(&self, size: usize) -> Result<NonNull<u8>, Error> {
        match self.classes.class_for(size) {
            Some(class) => self.alloc_small(class),
            None => self.alloc_large(size),
        }
    }

    fn alloc_small(&self, class: usize) -> Result<NonNull<u8>, Error> {
        if let Some(worker) = sched::try_current_worker() {
            // Safety: the cache belongs to this worker thread; the collector
            // only touches it while this thread is parked
            let cache = unsafe { worker.cache_mut() };
            if let Some(ptr) = cache.pop(class) {
                return Ok(ptr);
            }
            let mut pages = self.pages.lock();
            pages.refill(&self.map, class, &self.classes, REFILL_BATCH, |obj| {
                cache.push(class, obj);
            })?;
            drop(pages);
            return Ok(cache.pop(class).expect("refill produced no objects"));
        }

        // No worker identity (external thread): allocate centrally.
        let mut out = None;
        let mut pages = self.pages.lock();
        pages.refill(&self.map, class, &self.classes, 1, |obj| out = Some(obj))?;
        Ok(out.expect("refill produced no objects"))
    }

    fn alloc_large(&self, size: usize) -> Result<NonNull<u8>, Error> {
        let npages = size.div_ceil(PAGE_SIZE);
        let mut pages = self.pages.lock();
        let span = pages.alloc_span(&self.map, npages, CLASS_LARGE, npages * PAGE_SIZE)?;
        // Safety: just allocated, the single slot is free
        let ptr = unsafe { span.as_ref() }
            .pop_free_slot()
            .expect("large span has no slot");
        Ok(ptr)
    }

    /// Resolves a (possibly interior) pointer to its span and slot.
    #[inline]
    pub(crate) fn find_slot(&self, addr: usize) -> Option<(NonNull<Span>, usize)> {
        let span = self.map.span_at(addr)?;
        // Safety: span pointers in the map are live
        let slot = unsafe { span.as_ref() }.slot_of(addr)?;
        Some((span, slot))
    }

    /// Base address of the allocated object containing `addr`, if any.
    pub(crate) fn object_base(&self, addr: usize) -> Option<usize> {
        let (span, slot) = self.find_slot(addr)?;
        // Safety: span pointers in the map are live
        let span = unsafe { span.as_ref() };
        span.is_allocated(slot).then(|| span.slot_addr(slot))
    }

    // --- collector accounting ---

    pub(crate) fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn note_gc_started(&self) {
        self.gc_started.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn gc_started(&self) -> u64 {
        self.gc_started.load(Ordering::SeqCst)
    }

    pub(crate) fn collections_completed(&self) -> u64 {
        self.collections.load(Ordering::SeqCst)
    }

    /// Installs the post-collection heap target from the marked byte count.
    pub(crate) fn retarget(&self, marked_bytes: usize) {
        let percent = config::get().gc_percent;
        let next = core::cmp::max(
            marked_bytes.saturating_mul(100 + percent) / 100,
            MIN_NEXT_GC,
        );
        self.live_bytes.store(marked_bytes, Ordering::Relaxed);
        self.next_gc.store(next, Ordering::Relaxed);
        self.collections.fetch_add(1, Ordering::Relaxed);
    }
}

/// Allocates `size` managed bytes. The memory is zeroed unless
/// [`AllocFlags::NO_ZERO`] is set and is reclaimed by the collector once
/// unreachable.
pub fn alloc(size: usize, flags: AllocFlags) -> *mut u8 {
    heap().allocate(size, flags, None).as_ptr()
}

/// Allocates a zeroed managed object described by `ty`; the collector scans
/// it precisely through the descriptor's pointer map.
pub fn alloc_typed(ty: &'static TypeDesc) -> *mut u8 {
    heap().allocate(ty.size, AllocFlags::empty(), Some(ty)).as_ptr()
}

/// Resolves a (possibly interior) pointer to the base of the live managed
/// object containing it, or `None` if it points at no live allocation.
pub fn find_base(ptr: *const u8) -> Option<*mut u8> {
    heap().object_base(ptr as usize).map(|addr| addr as *mut u8)
}

/// Current allocator statistics.
pub fn stats() -> Stats {
    let heap = heap();
    Stats {
        live_bytes: heap.live_bytes(),
        spans: heap.pages.lock().spans.len(),
        collections: heap.collections.load(Ordering::Relaxed),
        next_gc: heap.next_gc.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_desc_pointer_map() {
        static DESC: TypeDesc = TypeDesc {
            size: 40,
            ptrmap: &[0b0000_0101],
            name: "pair",
        };
        assert!(DESC.word_is_pointer(0));
        assert!(!DESC.word_is_pointer(1));
        assert!(DESC.word_is_pointer(2));
        assert!(!DESC.word_is_pointer(100), "past the bitmap means no pointer");
    }
}
