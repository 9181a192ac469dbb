// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Round-based hand-off between the dispatching thread and the pool threads.
//!
//! The dispatching thread ([`Lender`]) publishes a reference to the context of
//! a round on a shared board, together with the number of pool threads that
//! must take part in it. Each pool thread ([`Borrower`]) waits for a new round
//! number to appear. Pool threads whose index is below the requested count run
//! the round, the others merely record that the round happened. The lender
//! returns once every requested pool thread has released the reference.

use super::util::{ErasedRef, LifetimeParameterized, Status};
use crate::macros::{log_debug, log_error};
use crossbeam_utils::CachePadded;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// State of a pool thread after a call to [`Borrower::borrow()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// The thread took part in a round.
    Ran,
    /// A round happened but this thread wasn't requested for it.
    Skipped,
    /// The thread has been told to exit.
    Finished,
}

/// Status of the dispatching thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MainStatus {
    /// Waiting for the requested pool threads to finish a round.
    Waiting,
    /// All requested pool threads are done with the current round.
    Ready,
}

/// What the pool threads observe.
struct Board<T: LifetimeParameterized> {
    /// Sequence number of the latest round, starting at 1.
    round: u64,
    /// Number of pool threads requested for the latest round. Threads with an
    /// index in `0..active` take part in it.
    active: usize,
    /// Whether the pool threads must exit.
    finished: bool,
    /// Context of the latest round, cleared once the round is over.
    value: ErasedRef<T>,
}

/// Creates a [`Lender`] paired with `num_threads` [`Borrower`]s.
pub fn make_lending_group<T: LifetimeParameterized>(
    num_threads: usize,
) -> (Lender<T>, Vec<Borrower<T>>) {
    let shared = Arc::new(SharedContext {
        num_running: CachePadded::new(AtomicUsize::new(0)),
        num_panicking: CachePadded::new(AtomicUsize::new(0)),
        board: Status::new(Board {
            round: 0,
            active: 0,
            finished: false,
            value: ErasedRef::empty(),
        }),
        main_status: Status::new(MainStatus::Waiting),
    });

    let borrowers = (0..num_threads)
        .map(|id| Borrower {
            id,
            last_round: 0,
            shared: shared.clone(),
        })
        .collect();

    let lender = Lender {
        num_threads,
        round: 0,
        shared,
    };

    (lender, borrowers)
}

/// State shared between the dispatching thread and the pool threads.
struct SharedContext<T: LifetimeParameterized> {
    /// Number of requested pool threads still running the current round.
    num_running: CachePadded<AtomicUsize>,
    /// Number of pool threads that panicked during the current round.
    num_panicking: CachePadded<AtomicUsize>,
    /// Round announcements for the pool threads.
    board: Status<Board<T>>,
    /// Completion signal for the dispatching thread.
    main_status: Status<MainStatus>,
}

/// Dispatching side of a lending group.
pub struct Lender<T: LifetimeParameterized> {
    /// Number of pool threads in the group.
    num_threads: usize,
    /// Sequence number of the last round.
    round: u64,
    /// State shared with the pool threads.
    shared: Arc<SharedContext<T>>,
}

impl<T: LifetimeParameterized> Lender<T> {
    /// Lends `value` to the first `num_workers` pool threads, runs `on_main` on
    /// the current thread meanwhile, and waits until the pool threads are done
    /// with `value`.
    ///
    /// With `num_workers == 0` the pool threads aren't woken up at all.
    ///
    /// If `on_main` or any pool thread panics, the panic is propagated after
    /// all the requested pool threads have released `value`.
    pub fn lend<R>(
        &mut self,
        value: &T::T<'_>,
        num_workers: usize,
        on_main: impl FnOnce() -> R,
    ) -> R {
        assert!(
            num_workers <= self.num_threads,
            "cannot lend to {num_workers} workers out of {}",
            self.num_threads
        );
        if num_workers == 0 {
            log_debug!("[main thread] Running on the main thread only.");
            return on_main();
        }

        self.round += 1;
        let round = self.round;
        self.shared
            .num_running
            .store(num_workers, Ordering::SeqCst);

        // The reference stored here stays valid until the `clear()` below, which only
        // happens once all the requested pool threads are done with it (as
        // synchronized with `main_status`).
        self.shared.board.update_all(|board| {
            debug_assert!(
                board.value.is_empty(),
                "a round is already in flight on this lending group"
            );
            board.round = round;
            board.active = num_workers;
            board.value.set(value);
        });
        log_debug!("[main thread, round {round}] Woke up {num_workers} pool thread(s).");

        let result = catch_unwind(AssertUnwindSafe(on_main));

        log_debug!("[main thread, round {round}] Waiting for the pool threads.");
        let mut guard = self
            .shared
            .main_status
            .wait_while(|status| *status == MainStatus::Waiting);
        *guard = MainStatus::Waiting;
        drop(guard);

        self.shared.board.lock().value.clear();
        log_debug!("[main thread, round {round}] All pool threads are done.");

        let num_panicking = self.shared.num_panicking.swap(0, Ordering::SeqCst);
        match result {
            Err(payload) => {
                log_error!("[main thread, round {round}] The main thread panicked!");
                resume_unwind(payload)
            }
            Ok(_) if num_panicking != 0 => {
                log_error!("[main thread, round {round}] {num_panicking} worker thread(s) panicked!");
                panic!("{num_panicking} worker thread(s) panicked!");
            }
            Ok(r) => r,
        }
    }

    /// Tells the pool threads to exit.
    pub fn finish_workers(&mut self) {
        log_debug!("[main thread] Notifying pool threads to finish...");
        self.shared.board.update_all(|board| board.finished = true);
    }
}

/// Pool-thread side of a lending group.
pub struct Borrower<T: LifetimeParameterized> {
    /// Index of this pool thread.
    id: usize,
    /// Last round observed by this thread.
    last_round: u64,
    /// State shared with the dispatching thread.
    shared: Arc<SharedContext<T>>,
}

impl<T: LifetimeParameterized> Borrower<T> {
    /// Returns the index of this pool thread in its lending group.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Waits for the next round, and runs `f` on the lent value if this thread
    /// is requested for it.
    ///
    /// A thread may observe a later round than the one following the last it
    /// saw: it is then guaranteed not to have been requested in the rounds in
    /// between, as the lender waits for every requested thread.
    pub fn borrow(&mut self, f: impl FnOnce(&T::T<'_>)) -> WorkerState {
        let id = self.id;
        let last_round = self.last_round;
        log_debug!("[thread {id}] Waiting for a round after #{last_round}");

        let guard = self
            .shared
            .board
            .wait_while(|board| !board.finished && board.round == last_round);
        if guard.finished {
            log_debug!("[thread {id}] Received finish signal");
            return WorkerState::Finished;
        }

        let round = guard.round;
        self.last_round = round;
        if id >= guard.active {
            log_debug!("[thread {id}, round {round}] Not requested for this round.");
            return WorkerState::Skipped;
        }
        let value = guard.value;
        drop(guard);
        log_debug!("[thread {id}, round {round}] Processing...");

        // Whether `f` returns or panics, the lender must learn that this thread no
        // longer uses the value. This happens when the notifier is dropped.
        let notifier = Notifier {
            id,
            round,
            shared: &self.shared,
        };

        // SAFETY:
        // - The lender doesn't clear nor invalidate the value before every requested
        //   thread has dropped its `Notifier`, which happens after `f` returns.
        // - All threads only access the value through shared references.
        let value = unsafe { value.get() }.expect("a requested round must carry a value");
        f(value);

        drop(notifier);
        WorkerState::Ran
    }
}

/// Notifies the lender that a pool thread has finished its round (or has
/// panicked) when dropped.
struct Notifier<'a, T: LifetimeParameterized> {
    id: usize,
    round: u64,
    shared: &'a SharedContext<T>,
}

impl<T: LifetimeParameterized> Drop for Notifier<'_, T> {
    fn drop(&mut self) {
        let id = self.id;
        let round = self.round;

        if std::thread::panicking() {
            log_error!("[thread {id}, round {round}] Detected panic in this thread, notifying the main thread");
            self.shared.num_panicking.fetch_add(1, Ordering::SeqCst);
        }

        let running = self.shared.num_running.fetch_sub(1, Ordering::SeqCst);
        assert!(running > 0);
        if running == 1 {
            log_debug!("[thread {id}, round {round}] Last pool thread of the round, waking up the main thread.");
            if let Err(e) = self.shared.main_status.try_notify_one(MainStatus::Ready) {
                log_error!("[thread {id}] Failed to notify the main thread, the mutex was poisoned: {e:?}");
                panic!("Failed to notify the main thread, the mutex was poisoned: {e:?}");
            }
        } else {
            log_debug!(
                "[thread {id}, round {round}] {} pool thread(s) still running.",
                running - 1
            );
        }
    }
}
