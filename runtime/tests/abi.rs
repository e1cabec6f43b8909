// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Exercises the flat C surface the way compiled code would.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use weft_runtime as weft;
use weft::abi::{
    AbiSelectCase, SELECT_DIR_DEFAULT, SELECT_DIR_RECV, weft_chan_close, weft_chan_drop,
    weft_chan_make, weft_chan_recv, weft_chan_send, weft_defer_push, weft_defer_run,
    weft_gosched, weft_select_go, weft_task_spawn,
};

#[test]
fn chan_roundtrip_through_raw_handles() {
    common::init();
    weft::block_on(|| {
        let ch = weft_chan_make(size_of::<u64>(), 1);

        let value: u64 = 0xC0FFEE;
        let mut out: u64 = 0;
        let mut ok = false;
        // Safety: ch is a live handle, the buffers are 8 bytes
        unsafe {
            weft_chan_send(ch, std::ptr::from_ref(&value).cast());
            weft_chan_recv(ch, std::ptr::from_mut(&mut out).cast(), &mut ok);
        }
        assert!(ok);
        assert_eq!(out, 0xC0FFEE);

        // Safety: still a live handle
        unsafe { weft_chan_close(ch) };
        let mut zeroed: u64 = 1;
        // Safety: ditto
        unsafe {
            weft_chan_recv(ch, std::ptr::from_mut(&mut zeroed).cast(), &mut ok);
        }
        assert!(!ok, "closed channel reports ok=false");
        assert_eq!(zeroed, 0, "closed receive writes the zero value");

        // Safety: final release of the handle
        unsafe { weft_chan_drop(ch) };
    });
}

#[test]
fn spawned_entry_runs_with_its_argument() {
    common::init();
    static OBSERVED: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn entry(arg: *mut u8) {
        OBSERVED.store(arg as usize, Ordering::SeqCst);
    }

    weft::block_on(|| {
        weft_task_spawn(entry, 0x1234 as *mut u8);
        while OBSERVED.load(Ordering::SeqCst) == 0 {
            weft_gosched();
        }
    });
    assert_eq!(OBSERVED.load(Ordering::SeqCst), 0x1234);
}

#[test]
fn select_go_takes_default_when_idle() {
    common::init();
    weft::block_on(|| {
        let ch = weft_chan_make(size_of::<u32>(), 0);
        let mut slot: u32 = 0;
        let mut cases = [
            AbiSelectCase {
                dir: SELECT_DIR_RECV,
                chan: ch,
                elem: std::ptr::from_mut(&mut slot).cast(),
                ok: false,
            },
            AbiSelectCase {
                dir: SELECT_DIR_DEFAULT,
                chan: std::ptr::null_mut(),
                elem: std::ptr::null_mut(),
                ok: false,
            },
        ];
        // Safety: case 0 names a live channel and a 4-byte slot
        let chosen = unsafe { weft_select_go(cases.as_mut_ptr(), cases.len()) };
        assert_eq!(chosen, 1, "nothing ready: the default case wins");

        // Safety: release the handle
        unsafe { weft_chan_drop(ch) };
    });
}

#[test]
fn defer_push_and_run_are_lifo() {
    common::init();
    static TRAIL: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn record(arg: *mut u8) {
        // Append a digit: the final value encodes execution order.
        let digit = arg as usize;
        TRAIL.store(TRAIL.load(Ordering::SeqCst) * 10 + digit, Ordering::SeqCst);
    }

    weft::block_on(|| {
        weft_defer_push(record, 1 as *mut u8);
        weft_defer_push(record, 2 as *mut u8);
        weft_defer_push(record, 3 as *mut u8);
        weft_defer_run();
    });
    assert_eq!(TRAIL.load(Ordering::SeqCst), 321);
}
