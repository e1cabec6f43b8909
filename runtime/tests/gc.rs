// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use weft_runtime as weft;
use weft::heap::{AllocFlags, TypeDesc};

/// XOR mask that keeps object addresses held by the test invisible to the
/// conservative stack scan. Undisguise only after the object may be dead.
const DISGUISE: usize = 0x5A5A_5A5A_5A5A_5A5A;

/// Clobbers a chunk of stack so stale pointer copies from earlier frames
/// cannot linger inside the scanned window.
#[inline(never)]
fn scrub_stack() {
    let garbage = [0_usize; 256];
    black_box(&garbage);
}

/// A two-word node: word 0 is a managed pointer to the next node, word 1 is
/// payload.
static LIST_NODE: TypeDesc = TypeDesc {
    size: 16,
    ptrmap: &[0b0000_0001],
    name: "list_node",
};

#[inline(never)]
fn build_chain(len: usize) -> (usize, Vec<usize>) {
    let mut cookies = Vec::with_capacity(len);
    let mut next: usize = 0;
    for value in 0..len {
        let node = weft::heap::alloc_typed(&LIST_NODE);
        // Safety: alloc_typed returned a zeroed 16-byte object
        unsafe {
            node.cast::<usize>().write(next);
            node.cast::<usize>().add(1).write(value);
        }
        next = node as usize;
        cookies.push(next ^ DISGUISE);
    }
    (next ^ DISGUISE, cookies)
}

/// Property 4, liveness half: everything reachable from a root survives
/// collection with its contents intact.
#[test]
fn reachable_chain_survives_collection() {
    common::init();
    weft::block_on(|| {
        let root: &'static mut usize = Box::leak(Box::new(0_usize));
        let root_ptr = std::ptr::from_mut(root).cast::<u8>();
        weft::gc::add_root_region(root_ptr, size_of::<usize>());

        const LEN: usize = 100;
        let (head_cookie, cookies) = build_chain(LEN);
        *root = head_cookie ^ DISGUISE;
        scrub_stack();

        weft::gc::collect_now();
        weft::gc::collect_now();

        // Walk the chain through heap memory and check every node.
        let mut addr = *root;
        let mut seen = 0;
        while addr != 0 {
            assert_eq!(
                weft::heap::find_base(addr as *const u8),
                Some(addr as *mut u8),
                "rooted node was reclaimed"
            );
            // Safety: the node is live, as just asserted
            let value = unsafe { (addr as *const usize).add(1).read() };
            assert_eq!(value, LEN - 1 - seen, "node payload changed across GC");
            // Safety: word 0 is the next pointer
            addr = unsafe { (addr as *const usize).read() };
            seen += 1;
        }
        assert_eq!(seen, LEN);

        // Drop the root and verify the reclamation half below in a clean
        // stack state.
        *root = 0;
        weft::gc::remove_root_region(root_ptr);
        scrub_stack();
        weft::gc::collect_now();
        weft::gc::collect_now();

        for cookie in cookies {
            let addr = cookie ^ DISGUISE;
            assert_eq!(
                weft::heap::find_base(addr as *const u8),
                None,
                "unreachable node survived two collections"
            );
        }
    });
}

/// The finalizer scenario: register a finalizer, drop all references, force
/// two collections. The callback runs exactly once and the object is gone by
/// the second cycle.
#[test]
fn finalizer_runs_once_then_object_is_reclaimed() {
    common::init();
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    weft::block_on(|| {
        let cookie = {
            let obj = weft::heap::alloc(64, AllocFlags::NO_POINTERS);
            weft::set_finalizer(obj, |_| {
                CALLS.fetch_add(1, Ordering::SeqCst);
            }, 0);
            obj as usize ^ DISGUISE
        };
        scrub_stack();

        // First collection finds the object unreachable, resurrects it and
        // queues the callback.
        weft::gc::collect_now();
        let deadline = weft::time::monotonic_now_ns() + 2_000_000_000;
        while CALLS.load(Ordering::SeqCst) == 0 {
            assert!(
                weft::time::monotonic_now_ns() < deadline,
                "finalizer never ran"
            );
            weft::time::sleep(Duration::from_millis(5));
        }

        // Second collection reclaims it for real.
        scrub_stack();
        weft::gc::collect_now();

        assert_eq!(CALLS.load(Ordering::SeqCst), 1, "finalizer ran more than once");
        let addr = cookie ^ DISGUISE;
        assert_eq!(
            weft::heap::find_base(addr as *const u8),
            None,
            "finalized object survived its second collection"
        );
    });
}

static RECOVERED: AtomicUsize = AtomicUsize::new(0);
static AFTERWARD: AtomicUsize = AtomicUsize::new(0);

#[inline(never)]
fn install_recovering_panicker() {
    let obj = weft::heap::alloc(32, AllocFlags::NO_POINTERS);
    weft::set_finalizer(obj, |_| {
        weft::panicking::defer(|| {
            if weft::panicking::recover().is_some() {
                RECOVERED.fetch_add(1, Ordering::SeqCst);
            }
        });
        weft::panicking::panic_any("finalizer failure");
    }, 0);
}

#[inline(never)]
fn install_plain_counter() {
    let obj = weft::heap::alloc(32, AllocFlags::NO_POINTERS);
    weft::set_finalizer(obj, |_| {
        AFTERWARD.fetch_add(1, Ordering::SeqCst);
    }, 0);
}

/// A finalizer that panics and recovers must not take the runner task with
/// it: finalizers registered afterwards still run.
#[test]
fn recovered_finalizer_panic_keeps_the_runner_alive() {
    common::init();

    weft::block_on(|| {
        install_recovering_panicker();
        scrub_stack();
        weft::gc::collect_now();

        let deadline = weft::time::monotonic_now_ns() + 2_000_000_000;
        while RECOVERED.load(Ordering::SeqCst) == 0 {
            assert!(
                weft::time::monotonic_now_ns() < deadline,
                "panicking finalizer never ran"
            );
            weft::time::sleep(Duration::from_millis(5));
        }

        install_plain_counter();
        scrub_stack();
        weft::gc::collect_now();

        let deadline = weft::time::monotonic_now_ns() + 2_000_000_000;
        while AFTERWARD.load(Ordering::SeqCst) == 0 {
            assert!(
                weft::time::monotonic_now_ns() < deadline,
                "runner stopped draining after the recovered panic"
            );
            weft::time::sleep(Duration::from_millis(5));
        }
    });

    assert_eq!(RECOVERED.load(Ordering::SeqCst), 1);
    assert_eq!(AFTERWARD.load(Ordering::SeqCst), 1);
}

#[test]
fn removed_finalizer_never_runs() {
    common::init();
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    weft::block_on(|| {
        let obj = weft::heap::alloc(32, AllocFlags::NO_POINTERS);
        weft::set_finalizer(obj, |_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }, 0);
        assert!(weft::remove_finalizer(obj));
        assert!(!weft::remove_finalizer(obj), "second removal finds nothing");

        scrub_stack();
        weft::gc::collect_now();
        weft::gc::collect_now();
        weft::time::sleep(Duration::from_millis(20));
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    });
}

#[inline(never)]
fn stash_fresh_object(ch: &weft::chan::Chan<usize>) {
    let obj = weft::heap::alloc(48, AllocFlags::empty());
    ch.send(obj as usize);
}

#[test]
fn buffered_channel_elements_are_roots() {
    common::init();
    weft::block_on(|| {
        let ch = weft::chan::Chan::<usize>::new(4);
        // After this returns, the only copy of the address lives in the
        // channel's ring buffer.
        stash_fresh_object(&ch);
        scrub_stack();

        weft::gc::collect_now();
        weft::gc::collect_now();

        let addr = ch.recv().unwrap();
        assert_eq!(
            weft::heap::find_base(addr as *const u8),
            Some(addr as *mut u8),
            "object buffered in a channel was reclaimed"
        );
    });
}

#[test]
fn stats_reflect_collections() {
    common::init();
    weft::block_on(|| {
        let before = weft::heap::stats();
        for _ in 0..100 {
            black_box(weft::heap::alloc(128, AllocFlags::NO_POINTERS));
        }
        weft::gc::collect_now();
        let after = weft::heap::stats();
        assert!(after.collections > before.collections);
        assert!(after.next_gc >= after.live_bytes);
    });
}
