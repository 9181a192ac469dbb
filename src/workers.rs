// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Estimation of the number of threads taking part in a reduction.

use crate::macros::log_debug;
// Platforms that support `libc::sched_getaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_getaffinity, CpuSet},
    unistd::Pid,
};
use std::num::NonZeroUsize;

/// Number of threads used by [`ThreadCount::Debug`].
pub const DEBUG_THREAD_COUNT: NonZeroUsize = match NonZeroUsize::new(3) {
    Some(n) => n,
    None => unreachable!(),
};

/// Number of threads taking part in a reduction, including the thread that
/// calls [`dispatch()`](crate::Dispatcher::dispatch).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadCount {
    /// One thread per physical CPU core, or one thread per hardware thread if
    /// the core topology can't be queried.
    #[default]
    PhysicalCores,
    /// One thread per hardware thread available to this process.
    AvailableParallelism,
    /// A small fixed number of threads ([`DEBUG_THREAD_COUNT`]), which makes
    /// interleavings easier to follow while debugging.
    Debug,
    /// The given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads.
    ///
    /// Returns [`None`] if the hardware couldn't be queried, in which case the
    /// caller must pick a default.
    pub fn count(self) -> Option<NonZeroUsize> {
        match self {
            ThreadCount::PhysicalCores => {
                let logical = hardware_threads();
                match (physical_cores(), logical) {
                    // Affinity masks can restrict a process to fewer threads than there
                    // are cores.
                    (Some(physical), Some(logical)) => Some(physical.min(logical)),
                    (physical, logical) => physical.or(logical),
                }
            }
            ThreadCount::AvailableParallelism => hardware_threads(),
            ThreadCount::Debug => Some(DEBUG_THREAD_COUNT),
            ThreadCount::Count(count) => Some(count),
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Number of physical cores, if the topology is known.
fn physical_cores() -> Option<NonZeroUsize> {
    let cores = NonZeroUsize::new(num_cpus::get_physical());
    log_debug!("Physical cores: {cores:?}");
    cores
}

/// Number of hardware threads this process may run on.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn hardware_threads() -> Option<NonZeroUsize> {
    let from_affinity = sched_getaffinity(Pid::from_raw(0))
        .map(|cpu_set| {
            (0..CpuSet::count())
                .filter(|&cpu| cpu_set.is_set(cpu).unwrap_or(false))
                .count()
        })
        .ok()
        .and_then(NonZeroUsize::new);
    log_debug!("Hardware threads in the affinity mask: {from_affinity:?}");
    from_affinity.or_else(|| std::thread::available_parallelism().ok())
}

/// Number of hardware threads this process may run on.
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn hardware_threads() -> Option<NonZeroUsize> {
    let threads = std::thread::available_parallelism().ok();
    log_debug!("Available parallelism: {threads:?}");
    threads
}
