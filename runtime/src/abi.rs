// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The C-level surface compiled user code calls into.
//!
//! Everything here is a thin veneer over the typed internals: flat symbols,
//! raw channel handles (reference-counted behind the scenes), pointer-sized
//! panic values. The compiler side of the contract — prologue stack checks,
//! type descriptors, root tables — is consumed through [`TypeDesc`] and the
//! root-region registry.

use crate::chan::{RawChannel, Select};
use crate::heap::{AllocFlags, TypeDesc};
use crate::util::SendPtr;
use crate::{finalizer, gc, panicking, sched, task, time};
use std::sync::Arc;

/// A pointer-sized panic value raised through [`weft_panic`].
#[derive(Debug, Clone, Copy)]
pub struct AbiPanicValue(pub usize);

/// One arm of a [`weft_select_go`] call.
#[repr(C)]
pub struct AbiSelectCase {
    /// 0 = send, 1 = receive, 2 = default.
    pub dir: u32,
    /// The channel; ignored for default cases.
    pub chan: *mut RawChannel,
    /// Value source (send) or destination (receive).
    pub elem: *mut u8,
    /// Filled on return for the chosen case: receive got a real value.
    pub ok: bool,
}

pub const SELECT_DIR_SEND: u32 = 0;
pub const SELECT_DIR_RECV: u32 = 1;
pub const SELECT_DIR_DEFAULT: u32 = 2;

/// Spawns a task running `entry(arg)`. Returns immediately.
#[unsafe(no_mangle)]
pub extern "C" fn weft_task_spawn(entry: extern "C" fn(*mut u8), arg: *mut u8) {
    let arg = SendPtr(arg);
    sched::spawn(move || entry(arg.get()));
}

/// Creates a channel; the returned handle owns one reference, released by
/// [`weft_chan_drop`].
#[unsafe(no_mangle)]
pub extern "C" fn weft_chan_make(elem_size: usize, capacity: usize) -> *mut RawChannel {
    let ch = RawChannel::new(elem_size.max(1), capacity, None);
    Arc::into_raw(ch).cast_mut()
}

/// # Safety
///
/// `ch` must be a live handle from [`weft_chan_make`]; `src` must hold
/// `elem_size` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn weft_chan_send(ch: *mut RawChannel, src: *const u8) {
    // Safety: forwarded to the caller
    unsafe { (*ch).send(src) };
}

/// # Safety
///
/// `ch` must be a live handle; `dst` must accept `elem_size` bytes and `ok`
/// one bool.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn weft_chan_recv(ch: *mut RawChannel, dst: *mut u8, ok: *mut bool) {
    // Safety: forwarded to the caller
    unsafe {
        let got = (*ch).recv(dst);
        ok.write(got);
    }
}

/// # Safety
///
/// `ch` must be a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn weft_chan_close(ch: *mut RawChannel) {
    // Safety: forwarded to the caller
    unsafe { (*ch).close() };
}

/// Releases one channel reference.
///
/// # Safety
///
/// `ch` must be an owned handle that is not used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn weft_chan_drop(ch: *mut RawChannel) {
    // Safety: forwarded to the caller
    drop(unsafe { Arc::from_raw(ch.cast_const()) });
}

/// Multiway wait over `cases[0..n]`. Returns the index of the executed case
/// (or of the default case when nothing was ready).
///
/// # Safety
///
/// Every non-default case must name a live channel and a properly sized
/// element buffer.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn weft_select_go(cases: *mut AbiSelectCase, n: usize) -> usize {
    // Safety: forwarded to the caller
    let cases = unsafe { core::slice::from_raw_parts_mut(cases, n) };

    let mut select = Select::new();
    let mut default_index = None;
    // Maps select-internal case numbering back to the caller's indices.
    let mut indices = Vec::with_capacity(n);

    for (caller_index, case) in cases.iter().enumerate() {
        match case.dir {
            SELECT_DIR_SEND => {
                // Safety: live channel per the caller contract
                let chan = unsafe { &*case.chan };
                select.send_raw(chan, case.elem.cast_const());
                indices.push(caller_index);
            }
            SELECT_DIR_RECV => {
                // Safety: live channel per the caller contract
                let chan = unsafe { &*case.chan };
                select.recv_raw(chan, case.elem);
                indices.push(caller_index);
            }
            SELECT_DIR_DEFAULT => {
                select.with_default();
                default_index = Some(caller_index);
            }
            other => crate::util::rtabort!("select case with unknown direction {other}"),
        }
    }

    if indices.is_empty() {
        return default_index.expect("select with no cases and no default");
    }

    match select.wait() {
        Some(outcome) => {
            let caller_index = indices[outcome.index];
            cases[caller_index].ok = outcome.ok;
            caller_index
        }
        None => default_index.expect("select returned default without one"),
    }
}

/// Allocates `size` managed bytes; `flags` are [`AllocFlags`] bits.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn weft_alloc(size: usize, flags: u32) -> *mut u8 {
    crate::heap::alloc(size, AllocFlags::from_bits_truncate(flags))
}

/// Allocates a zeroed object described by `desc`.
///
/// # Safety
///
/// `desc` must point to a descriptor with static lifetime, per the compiler
/// contract.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn weft_alloc_typed(desc: *const TypeDesc) -> *mut u8 {
    // Safety: the compiler contract guarantees 'static descriptors
    crate::heap::alloc_typed(unsafe { &*desc })
}

/// The prologue contract: called on guard failure, commits more stack.
#[unsafe(no_mangle)]
pub extern "C" fn weft_stack_grow() {
    task::stack_check(16 * 1024);
}

/// Pushes a deferred call of `f(arg)` onto the current frame.
#[unsafe(no_mangle)]
pub extern "C" fn weft_defer_push(f: extern "C" fn(*mut u8), arg: *mut u8) {
    let arg = SendPtr(arg);
    panicking::defer_raw(move || f(arg.get()));
}

/// Runs the current frame's deferred calls, LIFO. The compiled epilogue.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn weft_defer_run() {
    panicking::run_current_frame_defers();
}

/// Raises a panic carrying a pointer-sized value.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn weft_panic(value: usize) -> ! {
    panicking::panic_any(AbiPanicValue(value))
}

/// Claims an in-flight panic from directly inside a deferred call; returns
/// its value, or 0 if there is nothing to recover.
#[unsafe(no_mangle)]
pub extern "C" fn weft_recover() -> usize {
    match panicking::recover() {
        Some(value) => value
            .downcast_ref::<AbiPanicValue>()
            .map_or(0, |abi| abi.0),
        None => 0,
    }
}

/// Voluntary yield.
#[unsafe(no_mangle)]
pub extern "C" fn weft_gosched() {
    sched::yield_now();
}

/// Parks the current task for `ns` nanoseconds.
#[unsafe(no_mangle)]
pub extern "C" fn weft_sleep_ns(ns: u64) {
    time::sleep_ns(ns);
}

/// Installs finalizer `f` on the object at `obj`.
///
/// # Safety
///
/// `obj` must be the base of a live managed allocation.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn weft_install_finalizer(
    obj: *mut u8,
    f: extern "C" fn(*mut u8),
    ret_size: usize,
) {
    finalizer::set_finalizer(obj, move |ptr| f(ptr), ret_size);
}

/// Forces a collection.
#[unsafe(no_mangle)]
pub extern "C" fn weft_gc_collect() {
    gc::collect_now();
}

/// Registers `start..start+bytes` (the compiled globals, typically) as a
/// conservative root region.
///
/// # Safety
///
/// The region must be word-aligned, mapped, and live for the process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn weft_add_root_region(start: *const u8, bytes: usize) {
    gc::add_root_region(start, bytes);
}
