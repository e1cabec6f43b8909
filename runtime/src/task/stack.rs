// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task stacks: one contiguous reservation each, growing downward.
//!
//! The committed window sits at the high end and is extended toward the low
//! end by [`TaskStack::grow`]; the lowest page is never committed and acts as
//! the guard. Growth never moves the stack, so pointers into it stay valid —
//! the property both the conservative stack scan and ordinary Rust code rely
//! on. Retired stacks are recycled through a size-keyed cache to avoid
//! remapping churn.

use crate::error::Error;
use crate::sync;
use crate::sys;
use crate::util::round_up;
use core::cell::Cell;
use core::num::NonZeroUsize;
use std::collections::HashMap;

/// Stacks kept per size class in the recycle cache.
const CACHE_PER_SIZE: usize = 32;

pub(crate) struct TaskStack {
    /// Lowest address of the mapping (the guard page).
    base: usize,
    /// Total mapping size including the guard page.
    reserve: usize,
    /// Bytes currently committed at the high end.
    committed: Cell<usize>,
}

impl TaskStack {
    /// Maps a stack with `reserve` bytes of address space and an initial
    /// committed window of `initial_commit` bytes.
    ///
    /// # Errors
    ///
    /// Fails with the underlying reserve/commit error on exhaustion.
    pub(crate) fn new(reserve: usize, initial_commit: usize) -> Result<TaskStack, Error> {
        let page = sys::page_size();
        let reserve = round_up(reserve.max(3 * page), page);
        let initial_commit = round_up(initial_commit.max(1), page).min(reserve - page);

        let base = sys::page_reserve(reserve)?;
        let stack = TaskStack {
            base: base.as_ptr() as usize,
            reserve,
            committed: Cell::new(0),
        };
        stack.commit_to(initial_commit)?;
        Ok(stack)
    }

    /// Highest usable address; 16-aligned because mappings are page-aligned.
    #[inline]
    pub(crate) fn top(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.base + self.reserve).expect("stack mapping at address zero")
    }

    /// Lowest committed address: the current stack guard.
    #[inline]
    pub(crate) fn limit(&self) -> usize {
        self.base + self.reserve - self.committed.get()
    }

    #[inline]
    pub(crate) fn reserve(&self) -> usize {
        self.reserve
    }

    #[inline]
    pub(crate) fn committed(&self) -> usize {
        self.committed.get()
    }

    /// Doubles the committed window (clamping at the guard page).
    ///
    /// Returns `false` when the stack cannot grow any further.
    pub(crate) fn grow(&self) -> bool {
        let page = sys::page_size();
        let max = self.reserve - page;
        let current = self.committed.get();
        if current >= max {
            return false;
        }
        let target = (current * 2).clamp(page, max);
        match self.commit_to(target) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("stack growth to {target} bytes failed: {err}");
                false
            }
        }
    }

    fn commit_to(&self, target: usize) -> Result<(), Error> {
        let current = self.committed.get();
        debug_assert!(target >= current);
        let lowest = (self.base + self.reserve - target) as *mut u8;
        // Safety: the range is inside our own reservation, above the guard page
        unsafe { sys::page_commit(lowest, target - current) }?;
        self.committed.set(target);
        Ok(())
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        // Safety: the mapping is exclusively owned and no context runs on it
        unsafe { sys::page_release(self.base as *mut u8, self.reserve) };
    }
}

// Safety: a stack is only ever used by one task at a time; handoff between
// worker threads happens through the scheduler's synchronization.
unsafe impl Send for TaskStack {}

/// Recycles retired stacks, keyed by reservation size.
pub(crate) struct StackCache {
    by_size: sync::Mutex<HashMap<usize, Vec<TaskStack>>>,
}

impl StackCache {
    pub(crate) fn new() -> Self {
        Self {
            by_size: sync::Mutex::new(HashMap::new()),
        }
    }

    /// Takes a cached stack of exactly `reserve` bytes or maps a new one.
    ///
    /// # Errors
    ///
    /// Propagates mapping failure for fresh stacks.
    pub(crate) fn take(&self, reserve: usize, initial_commit: usize) -> Result<TaskStack, Error> {
        if let Some(stack) = self
            .by_size
            .lock()
            .get_mut(&reserve)
            .and_then(Vec::pop)
        {
            return Ok(stack);
        }
        TaskStack::new(reserve, initial_commit)
    }

    /// Returns a retired stack to the cache (or unmaps it when full).
    pub(crate) fn put(&self, stack: TaskStack) {
        let mut by_size = self.by_size.lock();
        let slot = by_size.entry(stack.reserve()).or_default();
        if slot.len() < CACHE_PER_SIZE {
            slot.push(stack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_window_grows_toward_guard() {
        let page = sys::page_size();
        let stack = TaskStack::new(16 * page, page).unwrap();
        let limit_before = stack.limit();

        assert!(stack.grow());
        assert!(stack.limit() < limit_before);

        // Growth is capped at the guard page.
        while stack.grow() {}
        assert_eq!(stack.committed(), stack.reserve() - page);
    }

    #[test]
    fn committed_memory_is_writable_at_the_top() {
        let page = sys::page_size();
        let stack = TaskStack::new(8 * page, 2 * page).unwrap();
        let top = stack.top().get();
        // Safety: the top page was just committed
        unsafe {
            ((top - 8) as *mut u64).write(0xDEAD_BEEF);
            assert_eq!(((top - 8) as *const u64).read(), 0xDEAD_BEEF);
        }
    }

    #[test]
    fn cache_recycles_by_size() {
        let page = sys::page_size();
        let cache = StackCache::new();
        let stack = TaskStack::new(8 * page, page).unwrap();
        let top = stack.top();
        cache.put(stack);

        let again = cache.take(8 * page, page).unwrap();
        assert_eq!(again.top(), top, "same mapping handed back");
        assert!(cache.take(8 * page, page).unwrap().top() != top);
    }
}
