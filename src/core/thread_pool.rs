// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A pool of long-lived threads, woken up once per round.

use super::sync::{make_lending_group, Borrower, Lender, WorkerState};
use super::util::LifetimeParameterized;
use crate::error::Error;
use crate::macros::{log_debug, log_error, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
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
    sched::{sched_getaffinity, sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::JoinHandle;

/// Policy to pin pool threads to CPUs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin pool threads to CPUs.
    #[default]
    No,
    /// Pin each pool thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each pool thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented) or fails, building a dispatcher fails.
    Always,
}

/// Work that every participant of a round runs, the dispatching thread
/// included.
pub trait Round {
    /// Runs this round on the current thread.
    fn run(&self);
}

/// Represents a `dyn Round + Sync` with variable lifetime, via the generic
/// associated type of [`LifetimeParameterized`].
struct DynLifetimeSyncRound;

impl LifetimeParameterized for DynLifetimeSyncRound {
    type T<'a> = dyn Round + Sync + 'a;
}

/// A fixed set of pool threads, plus the dispatching side to drive them.
pub struct WorkerPool {
    /// Handles to all the pool threads.
    threads: Vec<JoinHandle<()>>,
    /// Hands rounds out to the pool threads.
    lender: Lender<DynLifetimeSyncRound>,
}

impl WorkerPool {
    /// Spawns `num_threads` pool threads.
    ///
    /// With pinning enabled, pool thread `i` is pinned to the `i + 1`-th CPU
    /// of the current affinity mask: the first CPU is left to the dispatching
    /// thread.
    pub fn new(num_threads: usize, cpu_pinning: CpuPinningPolicy) -> Result<Self, Error> {
        let (lender, borrowers) = make_lending_group(num_threads);

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                return Err(Error::CpuPinning(
                    "not implemented on this platform".to_owned(),
                ))
            }
        }

        #[cfg(all(
            not(miri),
            any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            )
        ))]
        let allowed_cpus = match cpu_pinning {
            CpuPinningPolicy::No => Vec::new(),
            _ => allowed_cpus(),
        };

        let mut pool = WorkerPool {
            threads: Vec::with_capacity(num_threads),
            lender,
        };

        let (pinned_tx, pinned_rx) = mpsc::channel::<Result<(), Error>>();
        for borrower in borrowers {
            let id = borrower.id();
            #[cfg(all(
                not(miri),
                any(
                    target_os = "android",
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "linux"
                )
            ))]
            let cpu = (!allowed_cpus.is_empty())
                .then(|| allowed_cpus[(id + 1) % allowed_cpus.len()]);
            let pinned_tx = pinned_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("parareduce-{id}"))
                .spawn(move || {
                    #[cfg(all(
                        not(miri),
                        any(
                            target_os = "android",
                            target_os = "dragonfly",
                            target_os = "freebsd",
                            target_os = "linux"
                        )
                    ))]
                    let pinned = pin_current_thread(id, cpu, cpu_pinning);
                    #[cfg(any(
                        miri,
                        not(any(
                            target_os = "android",
                            target_os = "dragonfly",
                            target_os = "freebsd",
                            target_os = "linux"
                        ))
                    ))]
                    let pinned = Ok(());
                    // The receiver may be gone if building already failed.
                    let _ = pinned_tx.send(pinned);
                    drop(pinned_tx);
                    run_pool_thread(borrower)
                })
                // On error, dropping the pool joins the threads spawned so far.
                .map_err(|source| Error::SpawnThread { id, source })?;
            pool.threads.push(handle);
        }
        drop(pinned_tx);
        log_debug!("[main thread] Spawned {num_threads} pool thread(s)");

        if let Some(e) = pinned_rx.iter().find_map(Result::err) {
            log_error!("[main thread] {e}");
            return Err(e);
        }
        Ok(pool)
    }

    /// Returns the number of pool threads.
    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Runs `round` on the first `num_workers` pool threads as well as on the
    /// current thread, and waits for all of them to finish.
    pub fn run(&mut self, round: &(dyn Round + Sync + '_), num_workers: usize) {
        self.lender.lend(round, num_workers, || round.run())
    }
}

impl Drop for WorkerPool {
    /// Joins all the threads in the pool.
    #[allow(clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        self.lender.finish_workers();

        log_debug!("[main thread] Joining threads in the pool...");
        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[main thread] Joined threads.");
    }
}

/// Main function of a pool thread.
fn run_pool_thread(mut borrower: Borrower<DynLifetimeSyncRound>) {
    loop {
        // A panicking round is reported to the dispatching thread by the borrower,
        // this thread stays available for the next rounds.
        let state = catch_unwind(AssertUnwindSafe(|| borrower.borrow(|round| round.run())));
        match state {
            Ok(WorkerState::Finished) => break,
            Ok(WorkerState::Ran | WorkerState::Skipped) => (),
            Err(_) => log_warn!("[thread {}] Recovered from a panic", borrower.id()),
        }
    }
}

/// CPUs in the affinity mask of the current thread.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn allowed_cpus() -> Vec<usize> {
    match sched_getaffinity(Pid::from_raw(0)) {
        Ok(cpu_set) => (0..CpuSet::count())
            .filter(|&cpu| cpu_set.is_set(cpu).unwrap_or(false))
            .collect(),
        Err(_e) => {
            log_warn!("Failed to query the CPU affinity: {_e}");
            Vec::new()
        }
    }
}

/// Pins the current pool thread to the given CPU, according to the policy.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(
    id: usize,
    cpu: Option<usize>,
    cpu_pinning: CpuPinningPolicy,
) -> Result<(), Error> {
    let pin = |cpu: Option<usize>| -> Result<usize, String> {
        let cpu = cpu.ok_or_else(|| "the CPU affinity mask is unknown".to_owned())?;
        let mut cpu_set = CpuSet::new();
        cpu_set.set(cpu).map_err(|e| e.to_string())?;
        sched_setaffinity(Pid::from_raw(0), &cpu_set).map_err(|e| e.to_string())?;
        Ok(cpu)
    };

    match cpu_pinning {
        CpuPinningPolicy::No => Ok(()),
        CpuPinningPolicy::IfSupported => {
            match pin(cpu) {
                Ok(_cpu) => log_debug!("Pinned thread #{id} to CPU #{_cpu}"),
                Err(_e) => log_warn!("Failed to set CPU affinity for thread #{id}: {_e}"),
            }
            Ok(())
        }
        CpuPinningPolicy::Always => match pin(cpu) {
            Ok(_cpu) => {
                log_debug!("Pinned thread #{id} to CPU #{_cpu}");
                Ok(())
            }
            Err(e) => Err(Error::CpuPinning(format!("thread #{id}: {e}"))),
        },
    }
}
