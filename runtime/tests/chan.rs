// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::time::Duration;
use weft_runtime as weft;
use weft::chan::{Chan, TryRecvError};

#[test]
fn unbuffered_rendezvous_transfers_value() {
    common::init();
    let got = weft::block_on(|| {
        let ch = Chan::<u64>::new(0);
        let tx = ch.clone();
        weft::spawn(move || tx.send(0xFEED));
        ch.recv()
    });
    assert_eq!(got, Some(0xFEED));
}

#[test]
fn buffered_sends_complete_without_receiver() {
    common::init();
    weft::block_on(|| {
        let ch = Chan::<i32>::new(3);
        ch.send(1);
        ch.send(2);
        ch.send(3);
        assert_eq!(ch.len(), 3);
        assert_eq!(ch.recv(), Some(1));
        assert_eq!(ch.recv(), Some(2));
        assert_eq!(ch.recv(), Some(3));
    });
}

/// The closed-recv scenario: capacity 3, send 1,2,3, close, receive four
/// times. Expected: (1,true),(2,true),(3,true),(0,false).
#[test]
fn close_drains_buffer_then_reports_closed() {
    common::init();
    weft::block_on(|| {
        let ch = Chan::<i32>::new(3);
        ch.send(1);
        ch.send(2);
        ch.send(3);
        ch.close();

        assert_eq!(ch.recv(), Some(1));
        assert_eq!(ch.recv(), Some(2));
        assert_eq!(ch.recv(), Some(3));
        assert_eq!(ch.recv(), None, "drained closed channel yields the zero value");
        assert_eq!(ch.recv(), None, "closed receive never blocks");
    });
}

#[test]
fn close_unblocks_parked_receivers() {
    common::init();
    let results = weft::block_on(|| {
        let ch = Chan::<u32>::new(0);
        let done = Chan::<Option<u32>>::new(0);

        for _ in 0..3 {
            let rx = ch.clone();
            let done = done.clone();
            weft::spawn(move || done.send(rx.recv()));
        }

        // Give the receivers time to park before the close.
        weft::time::sleep(Duration::from_millis(20));
        ch.close();

        (0..3).map(|_| done.recv().unwrap()).collect::<Vec<_>>()
    });
    assert_eq!(results, vec![None, None, None]);
}

#[test]
fn blocked_sender_completes_when_buffer_drains() {
    common::init();
    weft::block_on(|| {
        let ch = Chan::<u8>::new(1);
        let done = Chan::<()>::new(0);
        ch.send(1);

        let tx = ch.clone();
        let signal = done.clone();
        weft::spawn(move || {
            // Blocks: the buffer is full until the main task drains it.
            tx.send(2);
            signal.send(());
        });

        weft::time::sleep(Duration::from_millis(20));
        assert_eq!(ch.recv(), Some(1));
        assert_eq!(done.recv(), Some(()));
        assert_eq!(ch.recv(), Some(2), "parked sender's value moved into the buffer");
    });
}

#[test]
fn try_operations_never_block() {
    common::init();
    weft::block_on(|| {
        let ch = Chan::<i64>::new(1);
        assert_eq!(ch.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(ch.try_send(7), Ok(()));
        assert_eq!(ch.try_send(8), Err(8), "full buffer hands the value back");
        assert_eq!(ch.try_recv(), Ok(7));

        ch.close();
        assert_eq!(ch.try_recv(), Err(TryRecvError::Closed));
    });
}

#[test]
fn values_with_destructors_are_dropped_with_the_channel() {
    common::init();
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let drops = Arc::new(AtomicUsize::new(0));
    struct Probe(Arc<AtomicUsize>);
    impl Drop for Probe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let handle = Arc::clone(&drops);
    weft::block_on(move || {
        let ch = Chan::<Probe>::new(2);
        ch.send(Probe(Arc::clone(&handle)));
        ch.send(Probe(Arc::clone(&handle)));
        // Dropped with two buffered elements still inside.
    });
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

/// Property 1: for any sequence sent by one task on one channel, the receiver
/// observes exactly that sequence.
#[test]
fn fifo_order_per_sender() {
    common::init();
    use proptest::prelude::*;

    proptest!(ProptestConfig::with_cases(32), |(values in proptest::collection::vec(any::<i32>(), 0..64), cap in 0_usize..4)| {
        let sent = values.clone();
        let received = weft::block_on(move || {
            let ch = Chan::<i32>::new(cap);
            let tx = ch.clone();
            let n = sent.len();
            weft::spawn(move || {
                for v in sent {
                    tx.send(v);
                }
            });
            (0..n).map(|_| ch.recv().unwrap()).collect::<Vec<_>>()
        });
        prop_assert_eq!(received, values);
    });
}
