// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sys;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// The three-state word mutex.
///
/// The lock word moves between `UNLOCKED`, `LOCKED` and `CONTENDED`
/// (locked-with-waiters). The uncontended paths are a single compare-exchange;
/// only a thread that observes contention touches the kernel semaphore, which
/// is allocated lazily the first time any thread has to sleep.
///
/// Wakeup cannot be lost: the releasing thread stores `UNLOCKED` *before*
/// posting the semaphore, so a woken waiter always observes a releasable lock
/// word (it may still lose the race to a barging thread, in which case it
/// re-parks as `CONTENDED`).
pub(crate) struct RawWordLock {
    state: AtomicU32,
    sema: AtomicPtr<sys::Sema>,
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

const SPIN_LIMIT: u32 = 40;

/// An RAII-guarded mutex over the word lock.
pub(crate) type Mutex<T> = lock_api::Mutex<RawWordLock, T>;
pub(crate) type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawWordLock, T>;

// Safety: lock()/unlock() implement mutual exclusion (argued inline) and the
// guard may be sent across threads.
unsafe impl lock_api::RawMutex for RawWordLock {
    #[expect(clippy::declare_interior_mutable_const, reason = "lock_api requires this shape")]
    const INIT: Self = Self {
        state: AtomicU32::new(UNLOCKED),
        sema: AtomicPtr::new(core::ptr::null_mut()),
    };

    type GuardMarker = lock_api::GuardSend;

    #[inline]
    fn lock(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.sema().post();
        }
    }
}

impl RawWordLock {
    #[cold]
    fn lock_contended(&self) {
        let mut spins = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);

            if state == UNLOCKED {
                // Grab the lock as CONTENDED if anyone might be sleeping;
                // grabbing it as LOCKED here could strand a sleeper.
                let target = if spins >= SPIN_LIMIT { CONTENDED } else { LOCKED };
                if self
                    .state
                    .compare_exchange_weak(UNLOCKED, target, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            if spins < SPIN_LIMIT {
                spins += 1;
                core::hint::spin_loop();
                continue;
            }

            // Announce ourselves as a waiter, then sleep. If the CAS fails the
            // lock word changed and we retry the whole dance.
            if state == LOCKED
                && self
                    .state
                    .compare_exchange(LOCKED, CONTENDED, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
            {
                continue;
            }
            self.sema().wait();
            // The releaser posted exactly one waiter; contend again so a
            // subsequent release knows about any remaining sleepers.
            if self
                .state
                .compare_exchange(UNLOCKED, CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Returns the kernel semaphore, installing it on first contention.
    ///
    /// Installation is a single-shot CAS; losers free their allocation. The
    /// winner's semaphore intentionally leaks when the mutex is static, which
    /// every mutex in this runtime is.
    fn sema(&self) -> &sys::Sema {
        let existing = self.sema.load(Ordering::Acquire);
        if let Some(sema) = core::ptr::NonNull::new(existing) {
            // Safety: once installed, the semaphore lives as long as the lock
            return unsafe { sema.as_ref() };
        }

        let fresh = Box::into_raw(Box::new(sys::Sema::new()));
        match self.sema.compare_exchange(
            core::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // Safety: we just installed it
            Ok(_) => unsafe { &*fresh },
            Err(winner) => {
                // Safety: our allocation lost the race and was never shared
                drop(unsafe { Box::from_raw(fresh) });
                // Safety: the winning pointer is never replaced or freed
                unsafe { &*winner }
            }
        }
    }
}
