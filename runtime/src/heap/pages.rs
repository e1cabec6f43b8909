// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use crate::heap::classes::{MAX_CLASSES, SizeClasses};
use crate::heap::span::{CLASS_LARGE, Span};
use crate::heap::{PAGE_SHIFT, PAGE_SIZE};
use crate::sys;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::collections::BTreeMap;

/// Free page runs are bucketed by power-of-two length; the last bucket
/// catches every oversize run.
const RUN_BUCKETS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct FreeRun {
    len: usize,
    freed_epoch: u64,
    committed: bool,
}

/// Page index → owning span, readable without the heap mutex.
///
/// This is the O(1) pointer-to-span step every allocation and every mark
/// takes, so it lives outside the [`PageHeap`] lock; entries are published
/// with release stores by the (locked) span create/destroy paths.
pub(crate) struct SpanMap {
    arena_base: usize,
    arena_pages: usize,
    slots: Box<[AtomicPtr<Span>]>,
}

impl SpanMap {
    pub(crate) fn new(arena_base: NonNull<u8>, arena_bytes: usize) -> Self {
        let arena_pages = arena_bytes / PAGE_SIZE;
        Self {
            arena_base: arena_base.as_ptr() as usize,
            arena_pages,
            slots: (0..arena_pages)
                .map(|_| AtomicPtr::new(core::ptr::null_mut()))
                .collect(),
        }
    }

    #[inline]
    pub(crate) fn arena_base(&self) -> usize {
        self.arena_base
    }

    #[inline]
    pub(crate) fn arena_bytes(&self) -> usize {
        self.arena_pages * PAGE_SIZE
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.arena_base) < self.arena_bytes()
    }

    /// Span owning `addr`, if `addr` points into a live span.
    #[inline]
    pub(crate) fn span_at(&self, addr: usize) -> Option<NonNull<Span>> {
        let offset = addr.wrapping_sub(self.arena_base);
        let page = offset >> PAGE_SHIFT;
        if page >= self.arena_pages {
            return None;
        }
        NonNull::new(self.slots[page].load(Ordering::Acquire))
    }

    fn set_range(&self, start: usize, npages: usize, span: *mut Span) {
        for page in start..start + npages {
            self.slots[page].store(span, Ordering::Release);
        }
    }
}

/// The shared page heap: one reserved arena carved into spans.
///
/// All methods assume the heap mutex is held.
pub(crate) struct PageHeap {
    arena_base: usize,
    arena_pages: usize,
    /// First page that has never been part of any span.
    next_fresh: usize,
    /// Free runs keyed by start page, for coalescing.
    runs: BTreeMap<usize, FreeRun>,
    /// Start pages of free runs, bucketed by run length.
    buckets: [Vec<usize>; RUN_BUCKETS],
    /// Spans with free slots, per size class, for cache refills.
    nonfull: Vec<Vec<NonNull<Span>>>,
    /// Every live span, for the sweep walk.
    pub(crate) spans: Vec<NonNull<Span>>,
    /// Completed collections; stamps free runs for the decommit policy.
    pub(crate) gc_epoch: u64,
}

// Safety: PageHeap is only used under the heap mutex; the raw span pointers
// it holds are owned by it.
unsafe impl Send for PageHeap {}

impl PageHeap {
    pub(crate) fn new(arena_base: usize, arena_bytes: usize) -> Self {
        Self {
            arena_base,
            arena_pages: arena_bytes / PAGE_SIZE,
            next_fresh: 0,
            runs: BTreeMap::new(),
            buckets: core::array::from_fn(|_| Vec::new()),
            nonfull: vec![Vec::new(); MAX_CLASSES],
            spans: Vec::new(),
            gc_epoch: 0,
        }
    }

    /// Moves up to `want` free objects of `class` into the caller via `sink`,
    /// growing the heap when every existing span of the class is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates commit failure / arena exhaustion as [`Error::PageCommit`].
    pub(crate) fn refill(
        &mut self,
        map: &SpanMap,
        class: usize,
        classes: &SizeClasses,
        want: usize,
        mut sink: impl FnMut(NonNull<u8>),
    ) -> Result<(), Error> {
        let mut got = 0;
        while got < want {
            let span = match self.nonfull_span(class) {
                Some(span) => span,
                None => {
                    #[expect(clippy::cast_possible_truncation, reason = "class count < 2^16")]
                    let fresh = self.alloc_span(
                        map,
                        classes.pages_of(class),
                        class as u16,
                        classes.size_of(class),
                    )?;
                    fresh
                }
            };
            // Safety: spans in the nonfull lists stay alive until sweep frees
            // them, which cannot happen while we hold the heap mutex
            let span = unsafe { span.as_ref() };
            loop {
                if got >= want {
                    break;
                }
                match span.pop_free_slot() {
                    Some(slot) => {
                        sink(slot);
                        got += 1;
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// First span of `class` with free slots, pruning exhausted entries.
    fn nonfull_span(&mut self, class: usize) -> Option<NonNull<Span>> {
        loop {
            let &candidate = self.nonfull[class].last()?;
            // Safety: see refill
            let span = unsafe { candidate.as_ref() };
            if span.free_count() > 0 {
                return Some(candidate);
            }
            span.in_nonfull.store(false, Ordering::Relaxed);
            self.nonfull[class].pop();
        }
    }

    /// Re-registers a swept span that has free slots again.
    pub(crate) fn note_nonfull(&mut self, span: NonNull<Span>) {
        // Safety: caller holds the heap mutex and the span is live
        let r = unsafe { span.as_ref() };
        if r.class() != CLASS_LARGE && !r.in_nonfull.swap(true, Ordering::Relaxed) {
            self.nonfull[usize::from(r.class())].push(span);
        }
    }

    /// Allocates and registers a span of `npages` pages.
    pub(crate) fn alloc_span(
        &mut self,
        map: &SpanMap,
        npages: usize,
        class: u16,
        elem_size: usize,
    ) -> Result<NonNull<Span>, Error> {
        let start = self.take_run(npages)?;
        let base = self.arena_base + start * PAGE_SIZE;

        // Safety: take_run committed the pages and nothing else references them
        let span = unsafe { Span::new(base, npages, class, elem_size) };
        let span = NonNull::from(Box::leak(span));

        map.set_range(start, npages, span.as_ptr());
        self.spans.push(span);
        if class != CLASS_LARGE {
            // Safety: just created
            unsafe { span.as_ref() }
                .in_nonfull
                .store(true, Ordering::Relaxed);
            self.nonfull[usize::from(class)].push(span);
        }
        tracing::trace!(base, npages, class, elem_size, "span created");
        Ok(span)
    }

    /// Returns a fully-free span's pages to the free run index and drops its
    /// metadata. The caller must already have unlinked it from `spans`.
    pub(crate) fn free_span(&mut self, map: &SpanMap, span: NonNull<Span>) {
        // Safety: caller owns the span and has unlinked it
        let r = unsafe { span.as_ref() };
        let start = (r.base() - self.arena_base) / PAGE_SIZE;
        let npages = r.npages();
        tracing::trace!(base = r.base(), npages, "span released");

        map.set_range(start, npages, core::ptr::null_mut());
        if r.class() != CLASS_LARGE && r.in_nonfull.load(Ordering::Relaxed) {
            self.nonfull[usize::from(r.class())].retain(|&s| s != span);
        }
        self.insert_run(start, npages, true);

        // Safety: unlinked everywhere; reclaim the metadata box
        drop(unsafe { Box::from_raw(span.as_ptr()) });
    }

    /// Returns long-idle free runs to the OS, keeping their address space.
    pub(crate) fn decommit_idle(&mut self) {
        let epoch = self.gc_epoch;
        let starts: Vec<usize> = self
            .runs
            .iter()
            .filter(|(_, run)| run.committed && epoch.saturating_sub(run.freed_epoch) >= 2)
            .map(|(&start, _)| start)
            .collect();
        for start in starts {
            let run = self.runs.get_mut(&start).expect("run disappeared");
            let addr = (self.arena_base + start * PAGE_SIZE) as *mut u8;
            tracing::trace!(start, len = run.len, "decommitting idle pages");
            // Safety: the run is free, so no object lives in these pages
            unsafe { sys::page_decommit(addr, run.len * PAGE_SIZE) };
            run.committed = false;
        }
    }

    /// Finds (or grows) a committed run of `npages`.
    fn take_run(&mut self, npages: usize) -> Result<usize, Error> {
        debug_assert!(npages >= 1);

        for bucket in bucket_of(npages)..RUN_BUCKETS {
            let Some(pos) = self.buckets[bucket]
                .iter()
                .position(|&start| self.runs[&start].len >= npages)
            else {
                continue;
            };
            let start = self.buckets[bucket].swap_remove(pos);
            let run = self.runs.remove(&start).expect("bucket/map mismatch");

            if run.len > npages {
                self.insert_run_raw(
                    start + npages,
                    FreeRun {
                        len: run.len - npages,
                        freed_epoch: run.freed_epoch,
                        committed: run.committed,
                    },
                );
            }
            if !run.committed {
                self.commit_pages(start, npages)?;
            }
            return Ok(start);
        }

        // Nothing recycled fits; carve fresh pages off the arena.
        if self.next_fresh + npages > self.arena_pages {
            return Err(Error::PageCommit(libc::ENOMEM));
        }
        let start = self.next_fresh;
        self.commit_pages(start, npages)?;
        self.next_fresh += npages;
        Ok(start)
    }

    fn commit_pages(&self, start: usize, npages: usize) -> Result<(), Error> {
        let addr = (self.arena_base + start * PAGE_SIZE) as *mut u8;
        // Safety: the range lies inside the reserved arena
        unsafe { sys::page_commit(addr, npages * PAGE_SIZE) }
    }

    /// Inserts a free run, coalescing with free neighbors of the same
    /// commit state.
    fn insert_run(&mut self, mut start: usize, mut len: usize, committed: bool) {
        let epoch = self.gc_epoch;

        if let Some((&prev_start, &prev)) = self.runs.range(..start).next_back() {
            if prev_start + prev.len == start && prev.committed == committed {
                self.remove_run_raw(prev_start);
                start = prev_start;
                len += prev.len;
            }
        }
        if let Some(&next) = self.runs.get(&(start + len)) {
            if next.committed == committed {
                self.remove_run_raw(start + len);
                len += next.len;
            }
        }

        self.insert_run_raw(
            start,
            FreeRun {
                len,
                freed_epoch: epoch,
                committed,
            },
        );
    }

    fn insert_run_raw(&mut self, start: usize, run: FreeRun) {
        self.buckets[bucket_of(run.len)].push(start);
        self.runs.insert(start, run);
    }

    fn remove_run_raw(&mut self, start: usize) {
        let run = self.runs.remove(&start).expect("removing unknown run");
        let bucket = &mut self.buckets[bucket_of(run.len)];
        let pos = bucket
            .iter()
            .position(|&s| s == start)
            .expect("bucket/map mismatch");
        bucket.swap_remove(pos);
    }
}

#[inline]
fn bucket_of(len: usize) -> usize {
    debug_assert!(len >= 1);
    #[expect(clippy::cast_possible_truncation, reason = "ilog2 of usize fits")]
    core::cmp::min(len.ilog2() as usize, RUN_BUCKETS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap(pages: usize) -> (PageHeap, SpanMap) {
        let arena = crate::sys::page_reserve(pages * PAGE_SIZE).unwrap();
        (
            PageHeap::new(arena.as_ptr() as usize, pages * PAGE_SIZE),
            SpanMap::new(arena, pages * PAGE_SIZE),
        )
    }

    #[test]
    fn span_lookup_is_exact() {
        let (mut heap, map) = test_heap(64);
        let span = heap.alloc_span(&map, 2, 0, 32).unwrap();
        // Safety: just allocated
        let base = unsafe { span.as_ref() }.base();

        assert_eq!(map.span_at(base), Some(span));
        assert_eq!(map.span_at(base + 2 * PAGE_SIZE - 1), Some(span));
        assert_eq!(map.span_at(base + 2 * PAGE_SIZE), None);
    }

    #[test]
    fn freed_runs_are_reused_and_coalesced() {
        let (mut heap, map) = test_heap(64);
        let a = heap.alloc_span(&map, 1, 0, 32).unwrap();
        let b = heap.alloc_span(&map, 1, 0, 32).unwrap();
        // Safety: just allocated
        let a_base = unsafe { a.as_ref() }.base();

        heap.spans.retain(|&s| s != a && s != b);
        heap.free_span(&map, a);
        heap.free_span(&map, b);
        assert_eq!(heap.runs.len(), 1, "adjacent runs must coalesce");

        let c = heap.alloc_span(&map, 2, 1, 64).unwrap();
        // Safety: just allocated
        assert_eq!(unsafe { c.as_ref() }.base(), a_base, "coalesced run reused");
    }

    #[test]
    fn refill_delivers_distinct_objects() {
        let (mut heap, map) = test_heap(64);
        let classes = SizeClasses::generate();
        let class = classes.class_for(48).unwrap();

        let mut out = Vec::new();
        heap.refill(&map, class, &classes, 10, |p| out.push(p.as_ptr() as usize))
            .unwrap();
        assert_eq!(out.len(), 10);
        let unique: std::collections::HashSet<_> = out.iter().collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn arena_exhaustion_is_reported() {
        let (mut heap, map) = test_heap(4);
        assert!(heap.alloc_span(&map, 8, CLASS_LARGE, 8 * PAGE_SIZE).is_err());
    }
}
