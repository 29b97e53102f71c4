// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use taskloop::{gather, run, yield_now};

fn spawn_and_join(count: usize) {
    run(async move {
        let computations = (0..count).map(|_| async { yield_now().await });
        gather(computations).await
    })
    .unwrap()
    .unwrap();
}

fn bench_spawn(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_and_join");
    for count in [1usize, 10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| spawn_and_join(count));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_spawn);
criterion_main!(benches);
