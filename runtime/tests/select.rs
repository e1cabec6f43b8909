// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::time::Duration;
use weft_runtime as weft;
use weft::chan::{Chan, RecvSlot, Select, SendSlot};

/// The select-timeout scenario: the data channel delivers after 100 ms, the
/// timer after 10 ms. The timer case must win.
#[test]
fn timer_beats_slow_sender() {
    common::init();
    let timer_won = weft::block_on(|| {
        let data = Chan::<u32>::new(1);
        let tx = data.clone();
        weft::spawn(move || {
            weft::time::sleep(Duration::from_millis(100));
            tx.send(99);
        });

        let timeout = weft::time::after(Duration::from_millis(10));

        let mut data_slot = RecvSlot::new();
        let mut timer_slot = RecvSlot::new();
        let mut sel = Select::new();
        let data_case = sel.recv(&data, &mut data_slot);
        let timer_case = sel.recv(&timeout, &mut timer_slot);
        let outcome = sel.wait().expect("no default case");

        assert_ne!(outcome.index, data_case, "the slow sender must not win");
        outcome.index == timer_case
    });
    assert!(timer_won);
}

/// Property 2: with two always-ready cases, each wins between 1/4 and 3/4 of
/// any 1000-iteration window.
#[test]
fn shuffle_keeps_ready_cases_fair() {
    common::init();
    const ROUNDS: usize = 1000;

    let wins = weft::block_on(|| {
        let a = Chan::<u8>::new(1);
        let b = Chan::<u8>::new(1);
        let mut wins = [0_usize; 2];

        for _ in 0..ROUNDS {
            // Top both channels up; exactly one of them was drained by the
            // previous iteration.
            let _ = a.try_send(0);
            let _ = b.try_send(0);

            let mut slot_a = RecvSlot::new();
            let mut slot_b = RecvSlot::new();
            let mut sel = Select::new();
            let case_a = sel.recv(&a, &mut slot_a);
            sel.recv(&b, &mut slot_b);
            let outcome = sel.wait().expect("both cases ready");

            if outcome.index == case_a {
                wins[0] += 1;
            } else {
                wins[1] += 1;
            }
        }
        wins
    });

    for count in wins {
        assert!(
            (ROUNDS / 4..=3 * ROUNDS / 4).contains(&count),
            "case won {count} of {ROUNDS} rounds"
        );
    }
}

#[test]
fn default_fires_when_nothing_is_ready() {
    common::init();
    weft::block_on(|| {
        let ch = Chan::<u32>::new(0);
        let mut slot = RecvSlot::new();
        let mut sel = Select::new();
        sel.recv(&ch, &mut slot);
        sel.with_default();
        assert!(sel.wait().is_none(), "empty unbuffered channel cannot be ready");
    });
}

#[test]
fn send_case_completes_against_parked_receiver() {
    common::init();
    let received = weft::block_on(|| {
        let ch = Chan::<u64>::new(0);
        let done = Chan::<u64>::new(0);

        let rx = ch.clone();
        let out = done.clone();
        weft::spawn(move || out.send(rx.recv().unwrap()));
        weft::time::sleep(Duration::from_millis(20));

        let mut value = SendSlot::new(4242_u64);
        let mut sel = Select::new();
        let send_case = sel.send(&ch, &mut value);
        let outcome = sel.wait().expect("no default case");
        drop(sel);
        assert_eq!(outcome.index, send_case);
        assert!(value.reclaim(outcome).is_none(), "chosen send consumed the value");

        done.recv().unwrap()
    });
    assert_eq!(received, 4242);
}

#[test]
fn losing_send_case_hands_the_value_back() {
    common::init();
    weft::block_on(|| {
        let full = Chan::<String>::new(1);
        full.send(String::from("occupied"));
        let ready = Chan::<u8>::new(1);
        ready.send(0);

        let mut pending = SendSlot::new(String::from("reclaim me"));
        let mut slot = RecvSlot::new();
        let mut sel = Select::new();
        sel.send(&full, &mut pending);
        let recv_case = sel.recv(&ready, &mut slot);
        let outcome = sel.wait().expect("ready case exists");
        drop(sel);

        assert_eq!(outcome.index, recv_case);
        assert_eq!(pending.reclaim(outcome).as_deref(), Some("reclaim me"));
    });
}

#[test]
fn blocked_select_wakes_on_late_send() {
    common::init();
    let got = weft::block_on(|| {
        let a = Chan::<u32>::new(0);
        let b = Chan::<u32>::new(0);

        let tx = b.clone();
        weft::spawn(move || {
            weft::time::sleep(Duration::from_millis(15));
            tx.send(7);
        });

        let mut slot_a = RecvSlot::new();
        let mut slot_b = RecvSlot::new();
        let mut sel = Select::new();
        sel.recv(&a, &mut slot_a);
        let case_b = sel.recv(&b, &mut slot_b);
        let outcome = sel.wait().expect("no default case");
        drop(sel);

        assert_eq!(outcome.index, case_b);
        slot_b.take(outcome)
    });
    assert_eq!(got, Some(7));
}

#[test]
fn recv_case_sees_close() {
    common::init();
    weft::block_on(|| {
        let ch = Chan::<u32>::new(0);
        let victim = ch.clone();
        weft::spawn(move || {
            weft::time::sleep(Duration::from_millis(15));
            victim.close();
        });

        let mut slot = RecvSlot::new();
        let mut sel = Select::new();
        let case = sel.recv(&ch, &mut slot);
        let outcome = sel.wait().expect("no default case");
        drop(sel);

        assert_eq!(outcome.index, case);
        assert!(!outcome.ok, "close delivers the zero value with ok=false");
        assert!(slot.take(outcome).is_none());
    });
}
