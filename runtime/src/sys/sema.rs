// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The kernel-blocking counting semaphore.
//!
//! This is the one primitive that can put an OS thread to sleep; notes, the
//! word mutex and the scheduler's parking are all layered on top of it. On
//! Linux it is a bare futex; elsewhere a mutex/condvar pair stands in.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use core::sync::atomic::{AtomicU32, Ordering};

        #[derive(Debug)]
        pub struct Sema {
            value: AtomicU32,
        }

        impl Sema {
            pub const fn new() -> Self {
                Self { value: AtomicU32::new(0) }
            }

            pub fn post(&self) {
                self.value.fetch_add(1, Ordering::Release);
                futex_wake(&self.value);
            }

            pub fn wait(&self) {
                loop {
                    if self.try_take() {
                        return;
                    }
                    futex_wait(&self.value, 0, None);
                }
            }

            /// Waits up to `ns` nanoseconds. Returns `false` on timeout.
            pub fn wait_timeout(&self, ns: u64) -> bool {
                let deadline = super::monotonic_now_ns() + ns;
                loop {
                    if self.try_take() {
                        return true;
                    }
                    let now = super::monotonic_now_ns();
                    if now >= deadline {
                        return false;
                    }
                    futex_wait(&self.value, 0, Some(deadline - now));
                }
            }

            fn try_take(&self) -> bool {
                let mut cur = self.value.load(Ordering::Acquire);
                while cur > 0 {
                    match self.value.compare_exchange_weak(
                        cur,
                        cur - 1,
                        Ordering::Acquire,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return true,
                        Err(actual) => cur = actual,
                    }
                }
                false
            }
        }

        fn futex_wait(word: &AtomicU32, expect: u32, timeout_ns: Option<u64>) {
            #[expect(clippy::cast_possible_wrap, reason = "values bounded by the division")]
            let ts = timeout_ns.map(|ns| libc::timespec {
                tv_sec: (ns / 1_000_000_000) as libc::time_t,
                tv_nsec: (ns % 1_000_000_000) as libc::c_long,
            });
            let ts_ptr = ts
                .as_ref()
                .map_or(core::ptr::null(), |ts| core::ptr::from_ref(ts));

            // Safety: the futex word outlives the syscall; EAGAIN/EINTR/
            // ETIMEDOUT are all handled by the caller's retry loop
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word.as_ptr(),
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    expect,
                    ts_ptr,
                );
            }
        }

        fn futex_wake(word: &AtomicU32) {
            // Safety: the futex word is valid for the duration of the call
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word.as_ptr(),
                    libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                    1_i32,
                );
            }
        }
    } else {
        use std::sync::{Condvar, Mutex};
        use std::time::Duration;

        /// Portable fallback for hosts without a futex.
        #[derive(Debug)]
        pub struct Sema {
            count: Mutex<u64>,
            cond: Condvar,
        }

        impl Sema {
            pub const fn new() -> Self {
                Self {
                    count: Mutex::new(0),
                    cond: Condvar::new(),
                }
            }

            pub fn post(&self) {
                let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
                *count += 1;
                self.cond.notify_one();
            }

            pub fn wait(&self) {
                let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
                while *count == 0 {
                    count = self.cond.wait(count).unwrap_or_else(|e| e.into_inner());
                }
                *count -= 1;
            }

            /// Waits up to `ns` nanoseconds. Returns `false` on timeout.
            pub fn wait_timeout(&self, ns: u64) -> bool {
                let deadline = super::monotonic_now_ns() + ns;
                let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
                while *count == 0 {
                    let now = super::monotonic_now_ns();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .cond
                        .wait_timeout(count, Duration::from_nanos(deadline - now))
                        .unwrap_or_else(|e| e.into_inner());
                    count = guard;
                }
                *count -= 1;
                true
            }
        }
    }
}

impl Default for Sema {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn post_then_wait_does_not_block() {
        let sema = Sema::new();
        sema.post();
        sema.wait();
    }

    #[test]
    fn wait_timeout_expires() {
        let sema = Sema::new();
        assert!(!sema.wait_timeout(5_000_000));
    }

    #[test]
    fn cross_thread_handoff() {
        let sema = Arc::new(Sema::new());
        let posted = Arc::clone(&sema);
        let handle = std::thread::spawn(move || posted.post());
        assert!(sema.wait_timeout(5_000_000_000));
        handle.join().unwrap();
    }
}
