// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, criterion_group, criterion_main};
use weft_runtime as weft;
use weft::chan::Chan;

const ROUNDS: u64 = 1000;

fn roundtrips() -> u64 {
    weft::block_on(|| {
        let ping = Chan::<u64>::new(0);
        let pong = Chan::<u64>::new(0);

        let tx = ping.clone();
        let rx = pong.clone();
        weft::spawn(move || {
            for i in 0..ROUNDS {
                tx.send(i);
                let _ = rx.recv();
            }
        });

        let mut last = 0;
        for _ in 0..ROUNDS {
            last = ping.recv().unwrap();
            pong.send(last);
        }
        last
    })
}

fn bench_ping_pong(c: &mut Criterion) {
    weft::init();
    c.bench_function("ping_pong_1000", |b| b.iter(roundtrips));
}

criterion_group!(benches, bench_ping_pong);
criterion_main!(benches);
