// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Blocking parallel passes over a range of job indices.

use crate::buffer::{Partition, ReductionBuffer, CACHE_LINE};
use crate::core::{CpuPinningPolicy, Round, WorkerPool};
use crate::error::Error;
#[cfg(feature = "log_parallelism")]
use crate::macros::{log_info, log_trace};
use crate::macros::{log_debug, log_warn};
use crate::workers::ThreadCount;
use crossbeam_utils::CachePadded;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A builder for [`Dispatcher`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatcherBuilder {
    /// Number of threads taking part in a dispatch, the calling thread
    /// included.
    pub num_threads: ThreadCount,
    /// Number of threads to use if `num_threads` can't be determined from the
    /// hardware.
    pub fallback: Option<NonZeroUsize>,
    /// Alignment of the reduction buffer, in bytes. Must be a power of two.
    pub alignment: usize,
    /// Policy to pin the pool threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            num_threads: ThreadCount::PhysicalCores,
            fallback: None,
            alignment: CACHE_LINE,
            cpu_pinning: CpuPinningPolicy::No,
        }
    }
}

impl DispatcherBuilder {
    /// Spawns the pool threads of a new dispatcher.
    ///
    /// ```
    /// # use parareduce::{DispatcherBuilder, ThreadCount};
    /// let mut dispatcher = DispatcherBuilder {
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     ..Default::default()
    /// }
    /// .build()
    /// .unwrap();
    /// assert_eq!(dispatcher.num_threads().get(), 4);
    ///
    /// // One u64 counter per thread, padded to a cache line.
    /// assert!(dispatcher.allocate_buffer(64));
    /// dispatcher.dispatch(100, |_job, _slot, slice| {
    ///     let count = u64::from_ne_bytes(slice[..8].try_into().unwrap());
    ///     slice[..8].copy_from_slice(&(count + 1).to_ne_bytes());
    /// });
    ///
    /// let total: u64 = (0..4)
    ///     .map(|slot| u64::from_ne_bytes(dispatcher.thread_buffer(slot)[..8].try_into().unwrap()))
    ///     .sum();
    /// assert_eq!(total, 100);
    /// ```
    pub fn build(&self) -> Result<Dispatcher, Error> {
        Dispatcher::new(self)
    }
}

/// Runs blocking parallel passes over `0..job_count`, giving each
/// participating thread a private slice of a shared [`ReductionBuffer`].
///
/// A dispatcher owns `num_threads - 1` pool threads: the thread calling
/// [`dispatch()`](Self::dispatch) always takes part in the pass.
pub struct Dispatcher {
    /// Number of threads taking part in a dispatch, the calling thread
    /// included.
    num_threads: NonZeroUsize,
    /// Pool threads.
    pool: WorkerPool,
    /// Per-thread scratch memory.
    buffer: ReductionBuffer,
    /// Number of jobs processed by each thread slot since creation.
    #[cfg(feature = "log_parallelism")]
    jobs_per_slot: Box<[usize]>,
}

impl Dispatcher {
    /// Creates a new dispatcher using the given parameters.
    fn new(builder: &DispatcherBuilder) -> Result<Self, Error> {
        if !builder.alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment(builder.alignment));
        }
        let num_threads = match (builder.num_threads.count(), builder.fallback) {
            (Some(count), _) => count,
            (None, Some(fallback)) => {
                log_warn!(
                    "Cannot determine the number of threads for {:?}, falling back to {fallback}",
                    builder.num_threads
                );
                fallback
            }
            (None, None) => return Err(Error::UndeterminedThreadCount),
        };
        log_debug!("[main thread] Building a dispatcher with {num_threads} threads");

        let pool = WorkerPool::new(num_threads.get() - 1, builder.cpu_pinning)?;
        debug_assert_eq!(pool.num_threads(), num_threads.get() - 1);
        Ok(Self {
            num_threads,
            pool,
            buffer: ReductionBuffer::new(builder.alignment, num_threads.get()),
            #[cfg(feature = "log_parallelism")]
            jobs_per_slot: vec![0; num_threads.get()].into_boxed_slice(),
        })
    }

    /// Returns the number of threads taking part in a dispatch, the calling
    /// thread included.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.num_threads
    }

    /// Allocates `entry_size` bytes of scratch memory per thread. Does nothing
    /// if the current entry size is already `entry_size`.
    ///
    /// `entry_size` must be a multiple of the buffer alignment. The total
    /// buffer size is rounded up to a multiple of 64 bytes.
    ///
    /// Returns false if the allocation failed, in which case no buffer is
    /// allocated anymore.
    pub fn allocate_buffer(&mut self, entry_size: usize) -> bool {
        self.buffer.allocate(entry_size)
    }

    /// Fills the whole reduction buffer with zeros.
    pub fn zero_buffer(&mut self) {
        self.buffer.zero();
    }

    /// Size of each thread's slice of the reduction buffer, in bytes.
    pub fn entry_size(&self) -> usize {
        self.buffer.entry_size()
    }

    /// The whole reduction buffer, `num_threads() * entry_size()` bytes plus
    /// padding.
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    /// The whole reduction buffer, `num_threads() * entry_size()` bytes plus
    /// padding.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer.as_bytes_mut()
    }

    /// The slice of the reduction buffer owned by the given thread slot.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= num_threads()`.
    pub fn thread_buffer(&self, slot: usize) -> &[u8] {
        self.buffer.slice(slot)
    }

    /// Calls `callback(job, slot, slice)` exactly once for every `job` in
    /// `0..job_count`, in parallel, and returns once all calls have returned.
    ///
    /// Jobs are claimed dynamically, in increasing order, by
    /// `min(job_count, num_threads())` participating threads, among which the
    /// current thread. Each participant gets a distinct `slot` in
    /// `0..participants`, and `slice` is that slot's private part of the
    /// reduction buffer. Writes to the slices are visible once this function
    /// returns.
    ///
    /// # Panics
    ///
    /// Panics if `job_count` is zero, or if `callback` panicked on any thread.
    pub fn dispatch<F>(&mut self, job_count: usize, callback: F)
    where
        F: Fn(usize, usize, &mut [u8]) + Sync,
    {
        assert!(job_count > 0, "cannot dispatch zero jobs");
        let participants = job_count.min(self.num_threads.get());

        #[cfg(feature = "log_parallelism")]
        let jobs_per_slot = (0..participants)
            .map(|_| AtomicUsize::new(0))
            .collect::<Box<[_]>>();

        let context = DispatchContext {
            next_job: CachePadded::new(AtomicUsize::new(0)),
            next_thread: CachePadded::new(AtomicUsize::new(0)),
            job_count,
            callback: &callback,
            slices: self.buffer.partition(),
            #[cfg(feature = "log_parallelism")]
            jobs_per_slot: &jobs_per_slot,
        };
        log_debug!("[main thread] Dispatching {job_count} jobs on {participants} threads");
        self.pool.run(&context, participants - 1);

        debug_assert_eq!(context.next_thread.load(Ordering::Relaxed), participants);

        #[cfg(feature = "log_parallelism")]
        for (slot, jobs) in jobs_per_slot.iter().enumerate() {
            let jobs = jobs.load(Ordering::Relaxed);
            log_trace!("Slot {slot} processed {jobs} jobs");
            self.jobs_per_slot[slot] += jobs;
        }
    }

    /// Logs how many jobs each slot processed since creation.
    #[cfg(feature = "log_parallelism")]
    fn print_statistics(&self) {
        log_info!("Dispatch statistics:");
        for (slot, jobs) in self.jobs_per_slot.iter().enumerate() {
            log_info!("- slot {slot}: {jobs} jobs");
        }
        log_info!("- total: {} jobs", self.jobs_per_slot.iter().sum::<usize>());
    }
}

#[cfg(feature = "log_parallelism")]
impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.print_statistics();
    }
}

/// State of one [`Dispatcher::dispatch()`] call, shared by all participants.
struct DispatchContext<'a, F> {
    /// Next job index to claim.
    next_job: CachePadded<AtomicUsize>,
    /// Next thread slot to claim.
    next_thread: CachePadded<AtomicUsize>,
    /// Number of jobs.
    job_count: usize,
    callback: &'a F,
    /// Per-slot slices of the reduction buffer.
    slices: Partition<'a>,
    #[cfg(feature = "log_parallelism")]
    jobs_per_slot: &'a [AtomicUsize],
}

impl<F> Round for DispatchContext<'_, F>
where
    F: Fn(usize, usize, &mut [u8]) + Sync,
{
    fn run(&self) {
        // The counters only need to hand out distinct values: the end of the round is
        // synchronized by the worker pool.
        let slot = self.next_thread.fetch_add(1, Ordering::Relaxed);
        // SAFETY: Each slot value is handed out by `next_thread` at most once per
        // dispatch, and a `DispatchContext` lives for a single dispatch.
        let slice = unsafe { self.slices.claim(slot) };

        #[cfg(feature = "log_parallelism")]
        let mut jobs = 0;
        loop {
            let job = self.next_job.fetch_add(1, Ordering::Relaxed);
            if job >= self.job_count {
                break;
            }
            (self.callback)(job, slot, &mut *slice);
            #[cfg(feature = "log_parallelism")]
            {
                jobs += 1;
            }
        }

        #[cfg(feature = "log_parallelism")]
        self.jobs_per_slot[slot].store(jobs, Ordering::Relaxed);
    }
}
