// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod buffer;
mod core;
mod dispatcher;
mod error;
mod macros;
mod reduce;
mod workers;

pub use buffer::{ReductionBuffer, CACHE_LINE};
pub use core::CpuPinningPolicy;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::Error;
pub use reduce::{Element, ParallelReduce};
pub use workers::{ThreadCount, DEBUG_THREAD_COUNT};

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    macro_rules! expand_tests {
        ( $num_threads:expr, ) => {};
        ( $num_threads:expr, $case:ident, $( $others:tt )* ) => {
            #[test]
            fn $case() {
                $crate::test::$case($num_threads);
            }

            expand_tests!($num_threads, $($others)*);
        };
        ( $num_threads:expr, $case:ident => fail($msg:expr), $( $others:tt )* ) => {
            #[test]
            #[should_panic(expected = $msg)]
            fn $case() {
                $crate::test::$case($num_threads);
            }

            expand_tests!($num_threads, $($others)*);
        };
    }

    macro_rules! dispatch_tests {
        ( $mod:ident, $num_threads:expr, $( $tests:tt )* ) => {
            mod $mod {
                expand_tests!($num_threads, $($tests)*);
            }
        };
    }

    macro_rules! all_dispatch_tests {
        ( $mod:ident, $num_threads:expr ) => {
            dispatch_tests!(
                $mod,
                $num_threads,
                test_each_job_exactly_once,
                test_few_jobs,
                test_single_job,
                test_uneven_jobs,
                test_sum_integers,
                test_sum_twice,
                test_reallocate_between_dispatches,
                test_main_thread_panic => fail("arithmetic panic"),
                test_reusable_after_panic,
            );
        };
    }

    all_dispatch_tests!(one_thread, 1);
    all_dispatch_tests!(two_threads, 2);
    all_dispatch_tests!(four_threads, 4);
    all_dispatch_tests!(eight_threads, 8);

    // Panics on pool threads need a pool.
    dispatch_tests!(
        pool_two_threads,
        2,
        test_pool_thread_panic => fail("worker thread(s) panicked!"),
    );
    dispatch_tests!(
        pool_four_threads,
        4,
        test_pool_thread_panic => fail("worker thread(s) panicked!"),
    );
    dispatch_tests!(
        pool_eight_threads,
        8,
        test_pool_thread_panic => fail("worker thread(s) panicked!"),
    );

    fn dispatcher(num_threads: usize) -> Dispatcher {
        DispatcherBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            ..Default::default()
        }
        .build()
        .unwrap()
    }

    fn reduce(num_threads: usize) -> ParallelReduce<f64> {
        ParallelReduce::with_builder(DispatcherBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            ..Default::default()
        })
        .unwrap()
    }

    /// Checks that every index in `0..job_count` was seen exactly once, and
    /// returns the set of slots used.
    fn check_jobs(seen: Vec<(usize, usize)>, job_count: usize) -> HashSet<usize> {
        let mut jobs = seen.iter().map(|&(job, _)| job).collect::<Vec<_>>();
        jobs.sort_unstable();
        assert_eq!(jobs, (0..job_count).collect::<Vec<_>>());
        seen.into_iter().map(|(_, slot)| slot).collect()
    }

    fn test_each_job_exactly_once(num_threads: usize) {
        let mut dispatcher = dispatcher(num_threads);
        for job_count in [1, 2, 3, 10, 100, 10_000] {
            let seen = Mutex::new(Vec::with_capacity(job_count));
            dispatcher.dispatch(job_count, |job, slot, _| seen.lock().unwrap().push((job, slot)));
            let slots = check_jobs(seen.into_inner().unwrap(), job_count);
            let participants = job_count.min(num_threads);
            assert!(slots.len() <= participants);
            assert!(slots.iter().all(|&slot| slot < participants));
        }
    }

    fn test_few_jobs(num_threads: usize) {
        let mut dispatcher = dispatcher(num_threads);
        assert!(dispatcher.allocate_buffer(64));
        for job_count in 1..=num_threads {
            dispatcher.zero_buffer();
            let seen = Mutex::new(Vec::new());
            dispatcher.dispatch(job_count, |job, slot, slice| {
                // Record the job into the slot's private slice.
                slice[job] = 1;
                seen.lock().unwrap().push((job, slot));
            });
            let seen = seen.into_inner().unwrap();
            for &(job, slot) in &seen {
                assert_eq!(dispatcher.thread_buffer(slot)[job], 1);
            }
            let slots = check_jobs(seen, job_count);
            assert!(slots.len() <= job_count);

            // Nothing was written outside of the slots that processed each job.
            let ones = dispatcher.buffer().iter().filter(|&&b| b == 1).count();
            assert_eq!(ones, job_count);
        }
    }

    fn test_single_job(num_threads: usize) {
        let mut dispatcher = dispatcher(num_threads);
        let caller = std::thread::current().id();
        let calls = AtomicUsize::new(0);
        dispatcher.dispatch(1, |job, slot, _| {
            assert_eq!((job, slot), (0, 0));
            assert_eq!(std::thread::current().id(), caller);
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.into_inner(), 1);
    }

    fn test_uneven_jobs(num_threads: usize) {
        let mut reduce = reduce(num_threads);
        assert!(reduce.allocate_buffer(2));
        reduce.zero_buffer();

        let delays = {
            let mut rng = rand::rng();
            (0..64)
                .map(|_| Duration::from_micros(rng.random_range(0..200)))
                .collect::<Vec<_>>()
        };
        reduce.dispatch(delays.len(), |job, _slot, partial| {
            std::thread::sleep(delays[job]);
            partial[0] += 1.0;
            partial[1] += job as f64;
        });

        let (count, sum) = reduce
            .thread_buffers()
            .fold((0.0, 0.0), |(count, sum), partial| {
                (count + partial[0], sum + partial[1])
            });
        assert_eq!(count, 64.0);
        assert_eq!(sum, (63 * 64 / 2) as f64);
    }

    fn test_sum_integers(num_threads: usize) {
        let input = (0..=10_000).map(|x| x as f64).collect::<Vec<f64>>();
        let mut reduce = reduce(num_threads);
        assert!(reduce.allocate_buffer(1));
        reduce.zero_buffer();
        reduce.dispatch(input.len(), |job, _slot, partial| partial[0] += input[job]);
        let sum: f64 = reduce.thread_buffers().map(|partial| partial[0]).sum();
        assert_eq!(sum, (5_000 * 10_001) as f64);
    }

    fn test_sum_twice(num_threads: usize) {
        let input = (0..=10_000).map(|x| x as f64).collect::<Vec<f64>>();
        let mut reduce = reduce(num_threads);
        assert!(reduce.allocate_buffer(1));
        // The same dispatcher can run any number of passes.
        for _ in 0..2 {
            reduce.zero_buffer();
            reduce.dispatch(100, |job, _slot, partial| {
                partial[0] += input[job * 100..(job + 1) * 100].iter().sum::<f64>();
            });
            let sum: f64 = reduce.thread_buffers().map(|partial| partial[0]).sum();
            assert_eq!(sum, (5_000 * 10_001 - 10_000) as f64);
        }
    }

    fn test_reallocate_between_dispatches(num_threads: usize) {
        let mut reduce = reduce(num_threads);
        for len in [1, 8, 9, 30, 1] {
            assert!(reduce.allocate_buffer(len));
            reduce.zero_buffer();
            reduce.dispatch(1000, |job, _slot, partial| {
                assert!(partial.len() >= len);
                partial[job % len] += 1.0;
            });
            let total: f64 = reduce.buffer().iter().sum();
            assert_eq!(total, 1000.0);
        }
    }

    fn test_pool_thread_panic(num_threads: usize) {
        let mut dispatcher = dispatcher(num_threads);
        let caller = std::thread::current().id();
        let pool_started = AtomicBool::new(false);
        dispatcher.dispatch(100, |_, _, _| {
            if std::thread::current().id() == caller {
                // Hold this job until a pool thread has claimed one.
                while !pool_started.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            } else {
                pool_started.store(true, Ordering::Release);
                panic!("arithmetic panic");
            }
        });
    }

    fn test_main_thread_panic(num_threads: usize) {
        let mut dispatcher = dispatcher(num_threads);
        let caller = std::thread::current().id();
        let caller_started = AtomicBool::new(false);
        // More jobs than pool threads, so the caller always gets at least one
        // while the pool threads wait on their first job.
        dispatcher.dispatch(100, |_, _, _| {
            if std::thread::current().id() == caller {
                caller_started.store(true, Ordering::Release);
                panic!("arithmetic panic");
            }
            while !caller_started.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
        });
    }

    fn test_reusable_after_panic(num_threads: usize) {
        let mut dispatcher = dispatcher(num_threads);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            dispatcher.dispatch(1000, |job, _, _| {
                if job % 7 == 0 {
                    panic!("arithmetic panic");
                }
            })
        }));
        assert!(result.is_err());

        let calls = AtomicUsize::new(0);
        dispatcher.dispatch(1000, |_, _, _| {
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.into_inner(), 1000);
    }

    #[test]
    fn test_scenario_four_workers_ten_jobs() {
        let mut dispatcher = dispatcher(4);
        let seen = Mutex::new(Vec::new());
        dispatcher.dispatch(10, |job, slot, _| seen.lock().unwrap().push((job, slot)));
        let slots = check_jobs(seen.into_inner().unwrap(), 10);
        assert!(slots.len() <= 4);
    }

    #[test]
    fn test_scenario_entry_rounding() {
        // 8 bytes per thread on 4 threads: 32 bytes rounded up to 64.
        let mut dispatcher = DispatcherBuilder {
            num_threads: ThreadCount::try_from(4).unwrap(),
            alignment: 8,
            ..Default::default()
        }
        .build()
        .unwrap();
        assert!(dispatcher.allocate_buffer(8));
        assert_eq!(dispatcher.buffer().len(), 64);
        assert_eq!(dispatcher.buffer().as_ptr() as usize % 8, 0);

        // The typed view pads each thread's buffer to a cache line of 8 elements.
        let mut reduce = reduce(4);
        assert!(reduce.allocate_buffer(1));
        assert_eq!(reduce.thread_buffer_len(), 8);
    }

    #[test]
    fn test_drop_after_dispatch() {
        let mut dispatcher = dispatcher(4);
        assert!(dispatcher.allocate_buffer(128));
        dispatcher.dispatch(100, |_, _, slice| slice[0] = 1);
        drop(dispatcher);
    }

    #[test]
    fn test_fallback_thread_count() {
        let dispatcher = DispatcherBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            fallback: Some(std::num::NonZeroUsize::try_from(2).unwrap()),
            ..Default::default()
        }
        .build()
        .unwrap();
        assert_eq!(
            Some(dispatcher.num_threads()),
            ThreadCount::AvailableParallelism.count()
        );
    }
}
