// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use weft_runtime as weft;
use weft::chan::Chan;

/// The ping-pong scenario: two tasks exchange an integer through two
/// unbuffered channels 100,000 times; 200,000 messages total, no deadlock.
#[test]
fn ping_pong_two_hundred_thousand_messages() {
    common::init();
    const ROUNDS: u64 = 100_000;

    let total = weft::block_on(|| {
        let ping = Chan::<u64>::new(0);
        let pong = Chan::<u64>::new(0);

        let tx = ping.clone();
        let rx = pong.clone();
        weft::spawn(move || {
            let mut value = 0;
            for _ in 0..ROUNDS {
                tx.send(value);
                value = rx.recv().unwrap();
            }
        });

        let mut messages = 0_u64;
        for _ in 0..ROUNDS {
            let value = ping.recv().unwrap();
            messages += 1;
            pong.send(value + 1);
            messages += 1;
        }
        messages
    });

    println!("{total}");
    assert_eq!(total, 200_000);
}

/// The fan-in scenario: ten tasks send their index on a shared unbuffered
/// channel; the receiver's sum is 55.
#[test]
fn fan_in_sums_to_fifty_five() {
    common::init();
    let sum = weft::block_on(|| {
        let ch = Chan::<u64>::new(0);
        for index in 1..=10_u64 {
            let tx = ch.clone();
            weft::spawn(move || tx.send(index));
        }
        (0..10).map(|_| ch.recv().unwrap()).sum::<u64>()
    });
    assert_eq!(sum, 55);
}

#[test]
fn spawn_returns_before_the_task_runs() {
    common::init();
    weft::block_on(|| {
        let ch = Chan::<&'static str>::new(0);
        let tx = ch.clone();
        weft::spawn(move || tx.send("ran"));
        // If spawn ran the task inline, the unbuffered send would have
        // deadlocked before we got here.
        assert_eq!(ch.recv(), Some("ran"));
    });
}

#[test]
fn yield_now_interleaves_tasks() {
    common::init();
    const TASKS: usize = 8;
    const STEPS: usize = 100;

    let progress = Arc::new(AtomicUsize::new(0));
    let observed_sharing = weft::block_on({
        let progress = Arc::clone(&progress);
        move || {
            let done = Chan::<()>::new(0);
            for _ in 0..TASKS {
                let progress = Arc::clone(&progress);
                let done = done.clone();
                weft::spawn(move || {
                    for _ in 0..STEPS {
                        progress.fetch_add(1, Ordering::SeqCst);
                        weft::yield_now();
                    }
                    done.send(());
                });
            }
            for _ in 0..TASKS {
                assert_eq!(done.recv(), Some(()));
            }
            progress.load(Ordering::SeqCst)
        }
    });
    assert_eq!(observed_sharing, TASKS * STEPS);
}

#[test]
fn many_tasks_on_few_workers() {
    common::init();
    const TASKS: u64 = 500;

    let sum = weft::block_on(|| {
        let ch = Chan::<u64>::new(16);
        for i in 0..TASKS {
            let tx = ch.clone();
            weft::spawn(move || tx.send(i));
        }
        (0..TASKS).map(|_| ch.recv().unwrap()).sum::<u64>()
    });
    assert_eq!(sum, TASKS * (TASKS - 1) / 2);
}

#[test]
fn task_ids_are_distinct() {
    common::init();
    let ids = weft::block_on(|| {
        let ch = Chan::<u64>::new(0);
        for _ in 0..4 {
            let tx = ch.clone();
            weft::spawn(move || tx.send(weft::task::id().expect("task context")));
        }
        (0..4).map(|_| ch.recv().unwrap()).collect::<Vec<_>>()
    });
    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());
}
