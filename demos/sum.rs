// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Simple program that computes the sum of a slice with per-thread partial
//! sums, logging the dispatch statistics when run with
//! `--features log_parallelism`.

use parareduce::{CpuPinningPolicy, DispatcherBuilder, ParallelReduce, ThreadCount};
use std::hint::black_box;
use std::num::NonZeroUsize;

const CHUNK_SIZE: usize = 10_000;

fn main() {
    env_logger::init();

    let mut reduce = ParallelReduce::<f64>::with_builder(DispatcherBuilder {
        num_threads: ThreadCount::PhysicalCores,
        fallback: NonZeroUsize::new(4),
        cpu_pinning: CpuPinningPolicy::IfSupported,
        ..Default::default()
    })
    .expect("failed to build the thread pool");
    println!("threads = {}", reduce.num_threads());

    let input_size = 1_000_000;
    let input = black_box((0..input_size).map(|x| x as f64).collect::<Vec<f64>>());

    assert!(reduce.allocate_buffer(1), "failed to allocate the buffer");
    reduce.zero_buffer();
    reduce.dispatch(input.len().div_ceil(CHUNK_SIZE), |job, _slot, partial| {
        let start = job * CHUNK_SIZE;
        let end = input.len().min(start + CHUNK_SIZE);
        partial[0] += input[start..end].iter().sum::<f64>();
    });

    let sum: f64 = reduce.thread_buffers().map(|partial| partial[0]).sum();
    println!("sum = {sum}");
}
