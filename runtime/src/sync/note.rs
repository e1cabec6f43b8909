// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sys;
use crate::util::rtabort;
use core::sync::atomic::{AtomicU32, Ordering};

/// A one-shot event.
///
/// A `Note` starts clear. [`Note::wake`] makes it permanently signaled until
/// the next [`Note::clear`]; [`Note::sleep`] returns immediately once the note
/// is signaled, otherwise it blocks the calling OS thread. At most one thread
/// may sleep on a note at a time, which is exactly the shape worker parking
/// and the stop-the-world handshake need.
#[derive(Debug)]
pub(crate) struct Note {
    state: AtomicU32,
    sema: sys::Sema,
}

const CLEAR: u32 = 0;
const WAITING: u32 = 1;
const SIGNALED: u32 = 2;

impl Note {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU32::new(CLEAR),
            sema: sys::Sema::new(),
        }
    }

    /// Re-arms the note. The caller must guarantee no thread is sleeping on it.
    pub(crate) fn clear(&self) {
        let prev = self.state.swap(CLEAR, Ordering::Release);
        assert!(prev != WAITING, "cleared a note with a sleeper");
    }

    /// Signals the note, waking the sleeper if there is one. Idempotent until
    /// the next [`Note::clear`].
    pub(crate) fn wake(&self) {
        if self.state.swap(SIGNALED, Ordering::AcqRel) == WAITING {
            self.sema.post();
        }
    }

    /// Blocks until the note is (or has already been) signaled.
    pub(crate) fn sleep(&self) {
        match self
            .state
            .compare_exchange(CLEAR, WAITING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => self.sema.wait(),
            Err(SIGNALED) => {}
            Err(_) => rtabort!("two sleepers on one note"),
        }
    }

    /// Blocks until the note is signaled or `ns` nanoseconds pass.
    ///
    /// Returns `true` if the note was signaled.
    pub(crate) fn sleep_timeout(&self, ns: u64) -> bool {
        match self
            .state
            .compare_exchange(CLEAR, WAITING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(SIGNALED) => return true,
            Err(_) => rtabort!("two sleepers on one note"),
        }

        if self.sema.wait_timeout(ns) {
            return true;
        }

        // Timed out: retract the waiter claim. Losing this race means a wake
        // is in flight and has posted the semaphore; consume it so the count
        // stays balanced.
        match self
            .state
            .compare_exchange(WAITING, CLEAR, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => false,
            Err(_) => {
                self.sema.wait();
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wake_before_sleep_is_sticky() {
        let note = Note::new();
        note.wake();
        note.sleep();
        note.sleep();
        note.clear();
        assert!(!note.sleep_timeout(1_000_000));
    }

    #[test]
    fn sleep_timeout_reports_timeout() {
        let note = Note::new();
        assert!(!note.sleep_timeout(2_000_000));
        note.wake();
        assert!(note.sleep_timeout(2_000_000));
    }

    #[test]
    fn cross_thread_wake() {
        let note = Arc::new(Note::new());
        let waker = Arc::clone(&note);
        let handle = std::thread::spawn(move || waker.wake());
        note.sleep();
        handle.join().unwrap();
    }
}
