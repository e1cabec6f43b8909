// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use core::ffi::c_void;
use core::ptr::{self, NonNull};
use std::io;
use std::sync::OnceLock;

/// Host page size, cached after the first `sysconf` call.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // Safety: sysconf is always safe to call
        #[expect(clippy::cast_sign_loss, reason = "page size is positive")]
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        assert!(size.is_power_of_two());
        size
    })
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Reserves `len` bytes of address space without backing memory.
///
/// The region is inaccessible until parts of it are committed.
///
/// # Errors
///
/// Returns [`Error::PageReserve`] when the kernel refuses the mapping.
pub fn page_reserve(len: usize) -> Result<NonNull<u8>, Error> {
    debug_assert_eq!(len % page_size(), 0);

    // Safety: anonymous PROT_NONE mapping with no placement constraints
    let mapping = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if mapping == libc::MAP_FAILED {
        return Err(Error::PageReserve(last_errno()));
    }
    Ok(NonNull::new(mapping.cast::<u8>()).expect("mmap returned null"))
}

/// Commits `len` reserved bytes starting at `addr`, making them readable and
/// writable (and zero-filled on first touch).
///
/// # Errors
///
/// Returns [`Error::PageCommit`] when the system is out of memory.
///
/// # Safety
///
/// `addr..addr+len` must lie inside a region obtained from [`page_reserve`].
pub unsafe fn page_commit(addr: *mut u8, len: usize) -> Result<(), Error> {
    debug_assert_eq!(addr as usize % page_size(), 0);

    // Safety: range precondition forwarded to the caller
    let rc = unsafe {
        libc::mprotect(
            addr.cast::<c_void>(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        return Err(Error::PageCommit(last_errno()));
    }
    Ok(())
}

/// Returns committed pages to the OS but keeps the address space reserved.
///
/// # Safety
///
/// `addr..addr+len` must be a committed subrange of a reserved region, and
/// nothing may rely on its contents afterwards.
pub unsafe fn page_decommit(addr: *mut u8, len: usize) {
    // Safety: range precondition forwarded to the caller
    unsafe {
        libc::madvise(addr.cast::<c_void>(), len, libc::MADV_DONTNEED);
        libc::mprotect(addr.cast::<c_void>(), len, libc::PROT_NONE);
    }
}

/// Releases a reserved region entirely.
///
/// # Safety
///
/// `addr..addr+len` must be exactly a region obtained from [`page_reserve`]
/// with no live references into it.
pub unsafe fn page_release(addr: *mut u8, len: usize) {
    // Safety: range precondition forwarded to the caller
    let rc = unsafe { libc::munmap(addr.cast::<c_void>(), len) };
    debug_assert_eq!(rc, 0);
}

/// Non-decreasing nanosecond clock.
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: ts is a valid out-pointer
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
    #[expect(clippy::cast_sign_loss, reason = "monotonic time is non-negative")]
    {
        (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// Puts the calling OS thread to sleep for at least `ns` nanoseconds.
pub fn sleep_ns(ns: u64) {
    #[expect(clippy::cast_possible_wrap, reason = "values bounded by the division")]
    let mut req = libc::timespec {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (ns % 1_000_000_000) as libc::c_long,
    };
    loop {
        let mut rem = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Safety: req and rem are valid pointers
        let rc = unsafe { libc::nanosleep(&req, &mut rem) };
        if rc == 0 || last_errno() != libc::EINTR {
            return;
        }
        req = rem;
    }
}

/// An OS thread started through the portability layer.
#[derive(Debug)]
pub struct ThreadHandle {
    #[expect(dead_code, reason = "workers live for the process lifetime")]
    raw: libc::pthread_t,
}

/// Starts a new OS thread sharing this address space.
///
/// # Errors
///
/// Returns [`Error::ThreadSpawn`] on resource exhaustion (`EAGAIN`).
pub fn thread_spawn(
    entry: extern "C" fn(*mut c_void) -> *mut c_void,
    arg: *mut c_void,
) -> Result<ThreadHandle, Error> {
    // Safety: pthread_t is plain old data on every supported host
    let mut raw: libc::pthread_t = unsafe { core::mem::zeroed() };

    extern "C" fn shim(arg: *mut c_void) -> *mut c_void {
        // Safety: `arg` is the ThreadArg box leaked below, consumed once
        let boxed = unsafe { Box::from_raw(arg.cast::<ThreadArg>()) };
        (boxed.entry)(boxed.arg)
    }
    struct ThreadArg {
        entry: extern "C" fn(*mut c_void) -> *mut c_void,
        arg: *mut c_void,
    }

    let boxed = Box::into_raw(Box::new(ThreadArg { entry, arg }));
    // Safety: shim matches the pthread start routine signature and consumes
    // the leaked box exactly once
    let rc = unsafe {
        libc::pthread_create(
            &mut raw,
            ptr::null(),
            shim,
            boxed.cast::<c_void>(),
        )
    };
    if rc != 0 {
        // Safety: the thread never started, reclaim the argument box
        drop(unsafe { Box::from_raw(boxed) });
        return Err(Error::ThreadSpawn(rc));
    }
    // Safety: the handle is live; we never join workers
    unsafe { libc::pthread_detach(raw) };
    Ok(ThreadHandle { raw })
}
