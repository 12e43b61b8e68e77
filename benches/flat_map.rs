// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, criterion_group, criterion_main};
use std::sync::Arc;
use strand::test_util::ManualScheduler;
use strand::{Deferred, Erased, Fiber, FiberOp, FiberValue, OpRef, SchedulerRef};

const CHAIN_LENGTHS: &[usize] = &[1, 16, 256, 1024];

fn scheduler() -> SchedulerRef {
    Arc::new(ManualScheduler::new())
}

fn map_i32(
    f: impl Fn(i32) -> OpRef + Clone + Send + Sync + 'static,
) -> impl Fn(FiberValue) -> OpRef + Clone + Send + Sync + 'static {
    move |value: FiberValue| match value.get_value() {
        // Safety: these programs only ever carry `i32` payloads.
        Some(payload) => f(*unsafe { payload.get::<i32>() }),
        None => FiberOp::error_erased(value.underlying().clone()),
    }
}

// Build the chain outside the timing loop; only execution is measured.
fn pure_chain(c: &mut Criterion) {
    let scheduler = scheduler();

    for &length in CHAIN_LENGTHS {
        let mut op = FiberOp::value(0_i32);
        for _ in 0..length {
            op = op.flat_map(map_i32(|value| FiberOp::value(value + 1)));
        }

        c.bench_function(&format!("flat_map/pure_chain/{length}"), |b| {
            b.iter(|| Fiber::run(op.clone(), &scheduler).wait());
        });
    }
}

fn thunk_chain(c: &mut Criterion) {
    let scheduler = scheduler();

    for &length in CHAIN_LENGTHS {
        let mut op = FiberOp::thunk(|| Erased::new(0_i32));
        for _ in 0..length {
            op = op.flat_map(map_i32(|value| {
                FiberOp::thunk(move || Erased::new(value + 1))
            }));
        }

        c.bench_function(&format!("flat_map/thunk_chain/{length}"), |b| {
            b.iter(|| Fiber::run(op.clone(), &scheduler).wait());
        });
    }
}

// String payloads exercise the deep-copy path through the erased pool.
fn string_chain(c: &mut Criterion) {
    let scheduler = scheduler();

    for &length in &[1_usize, 16, 256] {
        let mut op = FiberOp::value(String::from("start"));
        for _ in 0..length {
            op = op.flat_map(|value: FiberValue| {
                let payload = value.get_value().expect("value state");
                // Safety: this program only ever carries `String` payloads.
                let mut current = unsafe { payload.get::<String>() }.clone();
                current.push('x');
                FiberOp::value(current)
            });
        }

        c.bench_function(&format!("flat_map/string_chain/{length}"), |b| {
            b.iter(|| Fiber::run(op.clone(), &scheduler).wait());
        });
    }
}

// Measure construction separately: this is the normalization hot path.
fn chain_construction(c: &mut Criterion) {
    for &length in CHAIN_LENGTHS {
        c.bench_function(&format!("flat_map/construction/{length}"), |b| {
            b.iter(|| {
                let mut op = FiberOp::value(0_i32);
                for _ in 0..length {
                    op = op.flat_map(map_i32(|value| FiberOp::value(value + 1)));
                }
                op
            });
        });
    }
}

criterion_group!(
    benches,
    pure_chain,
    thunk_chain,
    string_chain,
    chain_construction
);
criterion_main!(benches);
