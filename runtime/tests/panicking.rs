// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::sync::{Arc, Mutex};
use weft_runtime as weft;
use weft::panicking::{FrameOutcome, defer, frame, panic_any, recover};

/// Property 6, first half: deferred calls run in strict LIFO order.
#[test]
fn defers_run_lifo() {
    common::init();
    let order = weft::block_on(|| {
        let order = Arc::new(Mutex::new(Vec::new()));
        let outcome = frame(|| {
            for i in 0..4 {
                let order = Arc::clone(&order);
                defer(move || order.lock().unwrap().push(i));
            }
            "body"
        });
        assert!(matches!(outcome, FrameOutcome::Completed("body")));
        Arc::try_unwrap(order).unwrap().into_inner().unwrap()
    });
    assert_eq!(order, vec![3, 2, 1, 0]);
}

/// Property 6, second half: arguments reflect the values at the defer
/// statement, not at execution.
#[test]
fn defers_capture_at_push_time() {
    common::init();
    let seen = weft::block_on(|| {
        let seen = Arc::new(Mutex::new(Vec::new()));
        frame(|| {
            let x = 1;
            let log = Arc::clone(&seen);
            defer(move || log.lock().unwrap().push(x));

            let x = 2;
            let log = Arc::clone(&seen);
            defer(move || log.lock().unwrap().push(x));

            // Shadowing after the defers must not affect what they captured.
            let x = 99;
            std::hint::black_box(x);
        })
        .unwrap_or(());
        Arc::try_unwrap(seen).unwrap().into_inner().unwrap()
    });
    assert_eq!(seen, vec![2, 1]);
}

/// The recover scenario: a deferred function recovers a panic of 42 and the
/// frame returns the distinguished fallback value.
#[test]
fn recover_stops_a_panic() {
    common::init();
    let value = weft::block_on(|| {
        let outcome = frame(|| -> i32 {
            defer(|| {
                let payload = recover().expect("a panic is in flight");
                assert_eq!(*payload.downcast::<i32>().unwrap(), 42);
            });
            panic_any(42_i32)
        });
        assert!(matches!(outcome, FrameOutcome::Recovered));
        outcome.unwrap_or(7)
    });
    assert_eq!(value, 7);
}

#[test]
fn recover_outside_a_defer_returns_none() {
    common::init();
    weft::block_on(|| {
        assert!(recover().is_none(), "no panic, no defer: nothing to recover");
        let outcome = frame(|| {
            assert!(recover().is_none(), "directly in a frame body is not a defer");
        });
        assert!(matches!(outcome, FrameOutcome::Completed(())));
    });
}

/// An unrecovered panic unwinds frame by frame, running each frame's defers,
/// until some outer defer recovers it.
#[test]
fn panic_unwinds_through_nested_frames() {
    common::init();
    let trail = weft::block_on(|| {
        let trail = Arc::new(Mutex::new(Vec::new()));

        let outer = frame(|| {
            let log = Arc::clone(&trail);
            defer(move || {
                let recovered = recover().is_some();
                log.lock().unwrap().push(("outer", recovered));
            });

            let inner: FrameOutcome<()> = frame(|| {
                let log = Arc::clone(&trail);
                defer(move || {
                    // This defer runs during the unwind but does not recover.
                    log.lock().unwrap().push(("inner", false));
                });
                panic_any("escaping");
            });
            // Unreachable: the inner frame re-raises the panic.
            drop(inner);
            unreachable!("inner panic must propagate");
        });

        assert!(matches!(outer, FrameOutcome::Recovered));
        Arc::try_unwrap(trail).unwrap().into_inner().unwrap()
    });
    assert_eq!(trail, vec![("inner", false), ("outer", true)]);
}

/// Foreign Rust panics (here: an explicit panic!) are adopted as task panics
/// and can be recovered the same way.
#[test]
fn foreign_panics_are_adopted() {
    common::init();
    let message = weft::block_on(|| {
        let captured = Arc::new(Mutex::new(None));
        let outcome = frame(|| {
            let captured = Arc::clone(&captured);
            defer(move || {
                let payload = recover().expect("the foreign panic is in flight");
                let text = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .unwrap_or("<other>");
                *captured.lock().unwrap() = Some(text.to_string());
            });
            panic!("index out of range");
        });
        assert!(matches!(outcome, FrameOutcome::Recovered));
        Arc::try_unwrap(captured).unwrap().into_inner().unwrap()
    });
    assert_eq!(message.as_deref(), Some("index out of range"));
}

/// A panic raised by a deferred call itself keeps unwinding (and can be
/// recovered one frame out).
#[test]
fn panicking_defer_supersedes_normal_return() {
    common::init();
    let recovered_value = weft::block_on(|| {
        let outer = frame(|| {
            defer(|| {
                let payload = recover().expect("the defer's panic is in flight");
                assert_eq!(*payload.downcast::<&str>().unwrap(), "from defer");
            });
            let inner: FrameOutcome<u32> = frame(|| {
                defer(|| panic_any("from defer"));
                5
            });
            // The inner frame's body completed, but its defer panicked.
            drop(inner);
            unreachable!("the defer panic must propagate");
        });
        matches!(outer, FrameOutcome::Recovered)
    });
    assert!(recovered_value);
}
